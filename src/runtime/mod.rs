use crate::{
    app::App,
    models::AuthState,
    sync::SyncEvent,
    task_store::{Recovery, TaskStoreError},
};
use chrono::Local;
use tracing::{debug, info};

/// Drains worker results into state changes. Never blocks.
pub fn tick(app: &mut App) {
    handle_day_rollover(app);
    handle_auth(app);
    handle_sync(app);

    if let Some(expiry) = app.toast_expiry
        && Local::now() >= expiry
    {
        app.toast_expiry = None;
        app.toast_message = None;
    }
}

fn handle_auth(app: &mut App) {
    let Some(state) = app.handshake.pump(&mut app.guard) else {
        return;
    };

    match state {
        AuthState::Success => {
            app.toast("Notion linked.");
            app.open_engine();
        }
        AuthState::Failed => {
            let message = app
                .handshake
                .last_error()
                .unwrap_or("Notion authorization failed.")
                .to_string();
            app.toast(message);
        }
        AuthState::NotStarted | AuthState::Waiting => {}
    }
}

fn handle_sync(app: &mut App) {
    let events = match app.engine.as_mut() {
        Some(engine) => engine.pump(),
        None => return,
    };

    for event in events {
        match event {
            SyncEvent::RolledBack {
                local_id,
                error,
                discarded,
            } => {
                debug!(%local_id, discarded, "rolled back");
                report_store_error(app, &error, discarded);
            }
            SyncEvent::LoadFailed(error) | SyncEvent::TagsFailed(error) => {
                report_store_error(app, &error, 0);
            }
            SyncEvent::Created { .. }
            | SyncEvent::Updated { .. }
            | SyncEvent::Loaded { .. }
            | SyncEvent::TagsLoaded(_) => {}
        }
    }
}

fn report_store_error(app: &mut App, error: &TaskStoreError, discarded: usize) {
    match error.recovery() {
        Recovery::Relogin => {
            // Pending work is lost with the session.
            app.close_engine();
            app.handshake.mark_failed(error.to_string());
            app.toast(error.to_string());
        }
        Recovery::ReselectDatabase => {
            app.toast(format!("{error} Select a task database again."));
        }
        Recovery::Retry if discarded > 0 => {
            app.toast(format!("{error} ({discarded} queued edits discarded)"));
        }
        Recovery::Retry => app.toast(error.to_string()),
    }
}

fn handle_day_rollover(app: &mut App) {
    let today = Local::now().date_naive();
    if today == app.active_date {
        return;
    }
    info!(%today, "new day, reloading tasks");
    app.active_date = today;
    app.refresh();
}
