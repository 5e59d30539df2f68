//! Live reload channel.
//!
//! Browsers connect to a plain websocket served from dedicated threads. A
//! `"reload"` message is broadcast to every connected client whenever the
//! output directory changes.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tungstenite::WebSocket;

/// Clients beyond this many are closed, oldest first.
const MAX_CLIENTS: usize = 10;

type Clients = Arc<Mutex<Vec<WebSocket<TcpStream>>>>;

/// Binds the preferred port, falling back to any free one.
pub fn reserve_port(host: IpAddr, preferred: u16) -> std::io::Result<(TcpListener, u16)> {
    let listener = match TcpListener::bind(SocketAddr::new(host, preferred)) {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind(SocketAddr::new(host, 0))?,
    };

    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// The snippet injected into served pages.
pub fn client_script(port: u16) -> String {
    format!(
        r#"<script type="module">
const socket = new WebSocket(`ws://${{location.hostname}}:{port}`);
socket.addEventListener("message", event => {{
    if (event.data === "reload") window.location.reload();
}});
</script>
"#
    )
}

/// Accepts websocket clients on `listener` and returns the sender which
/// triggers a broadcast.
pub fn start(listener: TcpListener) -> (Sender<()>, [JoinHandle<()>; 2]) {
    let clients = Clients::default();

    let incoming = new_thread_ws_incoming(listener, clients.clone());
    let (tx, reload) = new_thread_ws_reload(clients);

    (tx, [incoming, reload])
}

fn new_thread_ws_incoming(server: TcpListener, clients: Clients) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("reload connection failed: {e}");
                    continue;
                }
            };

            match tungstenite::accept(stream) {
                Ok(socket) => clients
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(socket),
                Err(e) => tracing::debug!("websocket handshake failed: {e}"),
            }
        }
    })
}

fn new_thread_ws_reload(clients: Clients) -> (Sender<()>, JoinHandle<()>) {
    let (tx, rx) = channel();

    let thread = std::thread::spawn(move || {
        while rx.recv().is_ok() {
            // Collapse a burst of changes into one reload.
            while rx.try_recv().is_ok() {}

            let mut clients = clients.lock().unwrap_or_else(PoisonError::into_inner);
            broadcast(&mut clients);
            tracing::info!("reloaded {} client(s)", clients.len());
        }
    });

    (tx, thread)
}

fn broadcast(clients: &mut Vec<WebSocket<TcpStream>>) {
    let mut broken = vec![];

    for (i, socket) in clients.iter_mut().enumerate() {
        match socket.send("reload".into()) {
            Ok(_) => {}
            Err(tungstenite::Error::Io(e)) if e.kind() == ErrorKind::BrokenPipe => broken.push(i),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                broken.push(i)
            }
            Err(e) => tracing::error!("reload failed: {e}"),
        }
    }

    for i in broken.into_iter().rev() {
        clients.remove(i);
    }

    let len = clients.len();
    if len > MAX_CLIENTS {
        for mut socket in clients.drain(0..len - MAX_CLIENTS) {
            socket.close(None).ok();
        }
    }
}
