use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use tabletop_relay::connection::{self, Admission, CLOSE_POLICY_VIOLATION};
use tabletop_relay::rooms::RoomRegistry;
use tabletop_relay::store::{SqliteStore, Store};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "data/tabletop.db".to_string());
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Arc::new(SqliteStore::new(&db_path));
    let registry = Arc::new(RoomRegistry::new(store.clone()));

    // Open mode: the first connector to an unknown room becomes its owner
    // and later connectors are auto-enrolled. Set OPEN_ROOMS=0 to admit
    // strictly by pre-existing membership.
    let open_rooms = env::var("OPEN_ROOMS")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true);

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9090".to_string());
    let listener = TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind listener");
    info!("🎲 tabletop-relay listening on {bind_addr} (open_rooms={open_rooms})");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down, flushing dirty rooms");
                registry.shutdown();
                break;
            }
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let registry = Arc::clone(&registry);
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    handle_connection(registry, store, stream, open_rooms).await;
                });
            }
        }
    }
}

async fn handle_connection(
    registry: Arc<RoomRegistry>,
    store: Arc<SqliteStore>,
    stream: TcpStream,
    open_rooms: bool,
) {
    // Capture the request line during the WebSocket upgrade; rooms live at
    // /ws/<room_id> and identity arrives as query parameters (resolved by
    // the auth layer in front of this process).
    let mut path = String::new();
    let mut query = String::new();
    let callback = |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
                    resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
        path = req.uri().path().to_string();
        query = req.uri().query().unwrap_or("").to_string();
        Ok(resp)
    };
    let mut ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "websocket handshake failed");
            return;
        }
    };

    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let room_id = path.strip_prefix("/ws/").unwrap_or("").to_string();
    let user_id = params.get("user_id").cloned().unwrap_or_default();

    if room_id.is_empty() || user_id.is_empty() {
        let frame = CloseFrame {
            code: CloseCode::from(CLOSE_POLICY_VIOLATION),
            reason: "missing auth".into(),
        };
        let _ = ws.close(Some(frame)).await;
        return;
    }

    let username = params
        .get("username")
        .cloned()
        .unwrap_or_else(|| user_id.clone());
    let admission = Admission {
        room_id: room_id.clone(),
        user_id: user_id.clone(),
        username,
        gm_key: params.get("gm_key").cloned(),
    };

    if open_rooms {
        match store.get_room_owner(&room_id) {
            Ok(None) => {
                if let Err(e) = store.create_room(&room_id, &room_id, &user_id) {
                    // Lost a creation race; joining as a member is fine.
                    warn!(room_id = %room_id, error = %e, "room auto-create raced");
                    store.add_member(&room_id, &user_id).ok();
                }
            }
            Ok(Some(_)) => {
                store.add_member(&room_id, &user_id).ok();
            }
            Err(e) => warn!(room_id = %room_id, error = %e, "owner lookup failed"),
        }
    }

    connection::serve_socket(&registry, store.as_ref(), ws, admission).await;
}
