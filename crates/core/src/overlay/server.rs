use std::{
    net::{SocketAddr, TcpListener},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::parse_overlay_message;
use crate::{
    command::{Command, CommandSender},
    worker::{StopSignal, Worker},
    CliftError, Result,
};

const STOP_POLL: Duration = Duration::from_millis(50);

/// WebSocket listener that turns overlay messages into commands.
///
/// Runs its own single-threaded runtime on a worker thread; the frame loop
/// only ever sees the resulting [`Command::SetOverlay`] entries.
#[derive(Debug)]
pub struct OverlayServer {
    addr: SocketAddr,
    worker: Worker,
}

impl OverlayServer {
    /// Binds `bind` and serves overlay connections on a worker until stopped.
    pub fn spawn(bind: SocketAddr, commands: CommandSender) -> Result<Self> {
        let listener = TcpListener::bind(bind)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let worker = Worker::spawn("clift-overlay", move |stop| {
            if let Err(error) = serve(listener, commands, stop) {
                warn!(%error, "overlay listener stopped");
            }
        })?;
        info!(%addr, "overlay listener ready");

        Ok(Self { addr, worker })
    }

    /// Returns the address actually bound, useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Hands over the worker so it can be joined on shutdown.
    pub fn into_worker(self) -> Worker {
        self.worker
    }
}

fn serve(listener: TcpListener, commands: CommandSender, stop: StopSignal) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(commands);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !stop.is_stopped() {
                    tokio::time::sleep(STOP_POLL).await;
                }
            })
            .await?;
        Ok::<(), CliftError>(())
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(commands): State<CommandSender>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, commands))
}

async fn handle_socket(mut socket: WebSocket, commands: CommandSender) {
    debug!("overlay client connected");

    while let Some(message) = socket.next().await {
        let keep_going = match message {
            Ok(Message::Text(text)) => submit(&text, &commands),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => submit(text, &commands),
                Err(_) => {
                    debug!("dropping non-utf8 overlay message");
                    true
                }
            },
            Ok(Message::Close(_)) => false,
            Ok(_) => true,
            Err(error) => {
                debug!(%error, "overlay connection failed");
                false
            }
        };
        if !keep_going {
            break;
        }
    }

    debug!("overlay client disconnected");
}

/// Queues one message. Returns `false` once the command queue is closed.
fn submit(text: &str, commands: &CommandSender) -> bool {
    match parse_overlay_message(text) {
        Ok((deck, update)) => commands.send(Command::SetOverlay { deck, update }).is_ok(),
        Err(error) => {
            debug!(%error, "dropping malformed overlay message");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpStream,
        time::Instant,
    };

    use super::*;
    use crate::{command::CommandQueue, deck::DeckId};

    fn masked_text_frame(payload: &str) -> Vec<u8> {
        let bytes = payload.as_bytes();
        assert!(bytes.len() < 126);
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut frame = vec![0x81, 0x80 | bytes.len() as u8];
        frame.extend_from_slice(&mask);
        frame.extend(bytes.iter().enumerate().map(|(i, byte)| byte ^ mask[i % 4]));
        frame
    }

    fn handshake(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(
            stream,
            "GET / HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
        )
        .unwrap();

        let mut response = Vec::new();
        let mut byte = [0_u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            response.push(byte[0]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101"), "{response}");
        stream
    }

    #[test]
    fn forwards_valid_messages_and_drops_malformed_ones() {
        let queue = CommandQueue::new(16);
        let server = OverlayServer::spawn(SocketAddr::from(([127, 0, 0, 1], 0)), queue.sender()).unwrap();

        let mut client = handshake(server.local_addr());
        client.write_all(&masked_text_frame(r#"{"player":7,"active":true}"#)).unwrap();
        client.write_all(&masked_text_frame("{not json")).unwrap();
        client
            .write_all(&masked_text_frame(r#"{"player":1,"code":"x","active":true}"#))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = Vec::new();
        while received.is_empty() && Instant::now() < deadline {
            received.extend(queue.drain());
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(
            received,
            vec![Command::SetOverlay {
                deck: DeckId::B,
                update: crate::overlay::OverlayUpdate {
                    code: Some("x".into()),
                    result: None,
                    visible: true,
                },
            }]
        );

        drop(client);
        assert!(server.into_worker().stop_and_join(Duration::from_secs(5)));
    }

    #[test]
    fn serves_concurrent_connections_to_either_deck() {
        let queue = CommandQueue::new(16);
        let server = OverlayServer::spawn(SocketAddr::from(([127, 0, 0, 1], 0)), queue.sender()).unwrap();

        let mut first = handshake(server.local_addr());
        let mut second = handshake(server.local_addr());
        second
            .write_all(&masked_text_frame(r#"{"player":0,"code":"from second","active":true}"#))
            .unwrap();
        first
            .write_all(&masked_text_frame(r#"{"player":1,"executed":"from first","active":false}"#))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = Vec::new();
        while received.len() < 2 && Instant::now() < deadline {
            received.extend(queue.drain());
            std::thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(received.len(), 2, "{received:?}");
        assert!(received.contains(&Command::SetOverlay {
            deck: DeckId::A,
            update: crate::overlay::OverlayUpdate {
                code: Some("from second".into()),
                result: None,
                visible: true,
            },
        }));
        assert!(received.contains(&Command::SetOverlay {
            deck: DeckId::B,
            update: crate::overlay::OverlayUpdate {
                code: None,
                result: Some("from first".into()),
                visible: false,
            },
        }));

        drop((first, second));
        assert!(server.into_worker().stop_and_join(Duration::from_secs(5)));
    }
}
