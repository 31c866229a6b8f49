use crate::rooms::Room;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How long a room must stay quiet before its dirty state is flushed.
pub const AUTOSAVE_DEBOUNCE_SECONDS: f64 = 2.0;

/// Spawn the debounced save task for a room. At most one task runs per room
/// (the room's `ensure_autosave` flag gates spawning); it lives until the
/// room has been flushed clean.
pub fn schedule(room: Arc<Room>) {
    tokio::spawn(async move {
        run(room).await;
    });
}

async fn run(room: Arc<Room>) {
    loop {
        // Wait until changes stop for a full debounce window. A single-shot
        // timer would race with edits landing mid-sleep.
        let stamp = room.change_stamp();
        tokio::time::sleep(Duration::from_secs_f64(AUTOSAVE_DEBOUNCE_SECONDS)).await;
        if room.change_stamp() != stamp {
            continue;
        }

        match room.flush() {
            Ok(()) => {
                // More changes may have landed between flush and here.
                if room.autosave_pass_done() {
                    continue;
                }
                return;
            }
            Err(e) => {
                // Room stays dirty; retry after another debounce window.
                warn!(room_id = %room.room_id, error = %e, "autosave failed, will retry");
            }
        }
    }
}
