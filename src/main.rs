use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use task_reminder::app::App;
use task_reminder::config::Config;
use task_reminder::models::{AuthState, LocalId, StatusFilter, ViewKind};
use task_reminder::{logging, runtime};

const TICK: Duration = Duration::from_millis(100);
const USAGE: &str = "usage: task-reminder <status|login|logout|list [today|week|month] [--done|--all]|add <text>|done <local-id>|select <database-id>>";

enum Command {
    Status,
    Login,
    Logout,
    List(ViewKind, StatusFilter),
    Add(String),
    Done(LocalId),
    Select(String),
}

impl Command {
    fn parse(args: &[String]) -> Option<Command> {
        let (name, rest) = args.split_first()?;
        let command = match name.as_str() {
            "status" => Command::Status,
            "login" => Command::Login,
            "logout" => Command::Logout,
            "list" => {
                let mut view = ViewKind::Today;
                let mut filter = StatusFilter::Open;
                for arg in rest {
                    match arg.as_str() {
                        "--done" => filter = StatusFilter::Done,
                        "--all" => filter = StatusFilter::All,
                        other => view = ViewKind::parse(other)?,
                    }
                }
                Command::List(view, filter)
            }
            "add" if !rest.is_empty() => Command::Add(rest.join(" ")),
            "done" => Command::Done(LocalId::from_remote(rest.first()?)),
            "select" => Command::Select(rest.first()?.clone()),
            _ => return None,
        };
        Some(command)
    }
}

fn main() -> ExitCode {
    let config = Config::load();
    logging::init(&config.logging.level);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = Command::parse(&args) else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    let mut app = App::new(config);
    app.start();
    let result = run(&mut app, command);
    if let Some(message) = app.toast_message.take() {
        eprintln!("{message}");
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(app: &mut App, command: Command) -> Result<(), String> {
    match command {
        Command::Status => {
            print_status(app);
            Ok(())
        }
        Command::Login => {
            if app.auth_state() == AuthState::Success {
                println!("Already linked: {}", app.workspace_url().unwrap_or_default());
                return Ok(());
            }
            app.login().map_err(|e| e.to_string())?;
            println!("Complete the authorization in your browser...");
            drive(app, |app| !app.handshake.is_polling());
            print_status(app);
            Ok(())
        }
        Command::Logout => app.logout().map_err(|e| e.to_string()),
        Command::List(view, filter) => {
            require_task_list(app)?;
            app.change_view(view, filter);
            drive(app, |app| !app.is_busy());
            for task in app.tasks() {
                let mark = if task.status.is_done() { "x" } else { " " };
                println!("[{mark}] {:>3}% {}  ({})", task.weight, task.content, task.local_id);
            }
            Ok(())
        }
        Command::Add(content) => {
            require_task_list(app)?;
            let local_id = app.add_task(&content).ok_or("Nothing to add.")?;
            drive(app, |app| !app.is_busy());
            match app.tasks().iter().find(|task| task.local_id == local_id) {
                Some(task) => {
                    println!("{}", task.remote_id.as_deref().unwrap_or(local_id.as_str()));
                    Ok(())
                }
                None => Err("Task was not saved.".to_string()),
            }
        }
        Command::Done(local_id) => {
            require_task_list(app)?;
            app.complete_task(&local_id).map_err(|e| e.to_string())?;
            drive(app, |app| !app.is_busy());
            Ok(())
        }
        Command::Select(database_id) => {
            app.select_database(&database_id).map_err(|e| e.to_string())?;
            drive(app, |app| !app.is_busy());
            print_status(app);
            Ok(())
        }
    }
}

/// Waits for the initial load so later commands see the remote list.
fn require_task_list(app: &mut App) -> Result<(), String> {
    if app.engine.is_none() {
        return Err(match app.auth_state() {
            AuthState::Success => "Select a Notion database first.".to_string(),
            _ => "Not linked to Notion. Run `task-reminder login`.".to_string(),
        });
    }
    drive(app, |app| !app.is_busy());
    if app.engine.is_none() {
        return Err("Notion session expired. Run `task-reminder login`.".to_string());
    }
    Ok(())
}

fn drive(app: &mut App, done: impl Fn(&App) -> bool) {
    loop {
        runtime::tick(app);
        if done(app) {
            break;
        }
        thread::sleep(TICK);
    }
}

fn print_status(app: &App) {
    println!("state: {}", app.auth_state());
    if let Some(credential) = app.guard.current() {
        if let Some(name) = credential.workspace_name.as_deref() {
            println!("workspace: {name}");
        }
        if let Some(user) = credential.owner_name() {
            println!("user: {user}");
        }
        println!(
            "database: {}",
            credential.database_id.as_deref().unwrap_or("(not selected)")
        );
    }
    if let Some(url) = app.workspace_url() {
        println!("open: {url}");
    }
}
