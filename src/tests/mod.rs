#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! End-to-end handshake tests against an in-process stub server, over an
//! in-memory message transport.


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ssh_key::{Algorithm, PrivateKey};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::auth::Credentials;
use crate::client::{connect, Connection, Options, Transport, TransportEvent};
use crate::negotiation::Preferred;
use crate::wire::{self, Encoding};
use crate::{kex, mac, msg, Error};

use stub::StubServer;

/// Client side of an in-memory pipe: frames go out on a channel, the
/// open flag is shared with the test.
struct PipeTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

impl Transport for PipeTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| Error::TransportClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

struct Rig {
    conn: Connection,
    server: StubServer,
    c2s_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ev_tx: mpsc::UnboundedSender<TransportEvent>,
    err_rx: mpsc::UnboundedReceiver<Error>,
    open: Arc<AtomicBool>,
}

/// Channel-backed subscriber, so tests can await shell output.
fn subscribe(conn: &Connection) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (data_tx, data_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    conn.on_data(move |d| {
        let _ = data_tx.send(d.to_vec());
    });
    data_rx
}

fn rig(server_prefs: Preferred, etm: bool, configure: impl FnOnce(&mut StubServer)) -> Rig {
    let _ = env_logger::try_init();

    let client_key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).unwrap();
    let host_key = PrivateKey::random(&mut rand_core::OsRng, Algorithm::Ed25519).unwrap();
    let credentials = Credentials::new(
        "tester",
        "ssh-ed25519-cert-v01@openssh.com",
        b"stub certificate blob".to_vec(),
        client_key.clone(),
    );

    let mut server = StubServer::new(server_prefs, etm, host_key, client_key.public_key().clone());
    configure(&mut server);

    let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let (err_tx, err_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    let transport = PipeTransport {
        tx: c2s_tx,
        open: open.clone(),
    };
    let conn = connect(
        transport,
        ev_rx,
        credentials,
        move |e| {
            let _ = err_tx.send(e);
        },
        Options::default(),
    );

    Rig {
        conn,
        server,
        c2s_rx,
        ev_tx,
        err_rx,
        open,
    }
}

impl Rig {
    fn send_server_output(&mut self) {
        let out = self.server.take_out();
        if !out.is_empty() {
            let _ = self.ev_tx.send(TransportEvent::Data(out));
        }
    }

    /// Shuttle frames between client and stub until `pred` holds on the
    /// stub's observations.
    async fn pump_until(&mut self, pred: impl Fn(&StubServer) -> bool) {
        self.send_server_output();
        while !pred(&self.server) {
            let chunk = timeout(Duration::from_secs(5), self.c2s_rx.recv())
                .await
                .expect("timed out waiting for client output")
                .expect("client hung up");
            self.server.feed(&chunk).unwrap();
            self.send_server_output();
        }
    }

    /// Shuttle frames until the client reports a fatal error.
    async fn pump_until_error(&mut self) -> Error {
        self.send_server_output();
        loop {
            if let Ok(err) = self.err_rx.try_recv() {
                return err;
            }
            match timeout(Duration::from_secs(5), self.c2s_rx.recv()).await {
                Ok(Some(chunk)) => {
                    let _ = self.server.feed(&chunk);
                    self.send_server_output();
                }
                // The client closes the transport on fatal errors, so a
                // hangup means the error is on its way.
                Ok(None) | Err(_) => {
                    return timeout(Duration::from_secs(5), self.err_rx.recv())
                        .await
                        .expect("timed out waiting for the error")
                        .expect("error channel closed");
                }
            }
        }
    }
}

async fn handshake_scenario(server_prefs: Preferred, etm: bool) {
    let mut rig = rig(server_prefs, etm, |_| {});

    // Run all the way to the shell greeting: the client must return the
    // 5 delivered bytes to the window.
    rig.pump_until(|s| s.observed.window_adjusts.contains(&5)).await;
    assert!(rig.server.observed.auth_verified);
    assert_eq!(rig.server.observed.pty_term.as_deref(), Some("xterm-256color"));
    assert_eq!(rig.server.observed.pty_size, Some((80, 24)));
    assert!(rig.server.observed.shell_requested);

    // Subscribe only now: the greeting was buffered and must be replayed.
    let mut data_rx = subscribe(&rig.conn);
    let greeting = timeout(Duration::from_secs(5), data_rx.recv())
        .await
        .expect("timed out waiting for shell output")
        .unwrap();
    assert_eq!(greeting, b"hello");

    // Interactive traffic.
    rig.conn.write("ls\n");
    rig.pump_until(|s| s.observed.channel_data == b"ls\n").await;

    rig.conn.resize(100, 50);
    rig.pump_until(|s| s.observed.window_changes.contains(&(100, 50)))
        .await;

    // Orderly shutdown: DISCONNECT, then the transport closes.
    rig.conn.close();
    rig.pump_until(|s| s.observed.disconnected).await;
    timeout(Duration::from_secs(5), async {
        while rig.open.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transport never closed");

    assert!(rig.err_rx.try_recv().is_err(), "unexpected error");
}

#[tokio::test]
async fn handshake_with_curve25519_and_etm() {
    handshake_scenario(Preferred::DEFAULT, true).await;
}

#[tokio::test]
async fn handshake_with_group14_and_plain_mac() {
    let prefs = Preferred {
        kex: std::borrow::Cow::Borrowed(&[kex::DH_G14_SHA256]),
        mac: std::borrow::Cow::Borrowed(&[mac::HMAC_SHA256]),
        ..Preferred::DEFAULT
    };
    handshake_scenario(prefs, false).await;
}

#[tokio::test]
async fn pk_ok_forces_a_second_signature() {
    let mut rig = rig(Preferred::DEFAULT, true, |s| s.pk_ok_first = true);
    let mut data_rx = subscribe(&rig.conn);

    rig.pump_until(|s| s.observed.window_adjusts.contains(&5)).await;
    assert!(rig.server.observed.auth_verified);
    let greeting = timeout(Duration::from_secs(5), data_rx.recv())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(greeting, b"hello");
}

#[tokio::test]
async fn negotiation_failure_names_the_server_list() {
    let mut rig = rig(Preferred::DEFAULT, true, |_| {});
    // Discard the real stub output; this server speaks group1-sha1 only.
    rig.server.take_out();

    let mut kexinit = vec![msg::KEXINIT];
    kexinit.extend_from_slice(&[0u8; 16]);
    kexinit.extend_list(["diffie-hellman-group1-sha1"].iter());
    kexinit.extend_list(["ssh-rsa"].iter());
    for _ in 0..2 {
        kexinit.extend_list(["aes128-ctr"].iter());
    }
    for _ in 0..2 {
        kexinit.extend_list(["hmac-sha2-256"].iter());
    }
    for _ in 0..2 {
        kexinit.extend_list(["none"].iter());
    }
    for _ in 0..2 {
        kexinit.extend_list(std::iter::empty::<&str>());
    }
    kexinit.push(0);
    kexinit.push_u32_be(0);

    let mut frame = b"SSH-2.0-legacy\r\n".to_vec();
    frame.extend_from_slice(&wire::build_packet(&kexinit, false));
    let _ = rig.ev_tx.send(TransportEvent::Data(frame));

    let err = timeout(Duration::from_secs(5), rig.err_rx.recv())
        .await
        .expect("timed out")
        .unwrap();
    let message = format!("{err}");
    assert!(
        message.contains("diffie-hellman-group1-sha1"),
        "{message}"
    );
}

#[tokio::test]
async fn corrupted_packet_is_fatal() {
    let mut rig = rig(Preferred::DEFAULT, true, |s| s.corrupt_after_auth = true);
    let err = rig.pump_until_error().await;
    assert!(matches!(err, Error::PacketAuth), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn silent_server_hits_the_kex_timeout() {
    let mut rig = rig(Preferred::DEFAULT, true, |_| {});
    rig.send_server_output();

    // Swallow the client's KEXINIT and kex init; never reply.
    let _ = timeout(Duration::from_secs(60), rig.c2s_rx.recv()).await;

    let err = timeout(Duration::from_secs(60), rig.err_rx.recv())
        .await
        .expect("timed out waiting for the kex timeout")
        .unwrap();
    assert!(matches!(err, Error::KexTimeout), "{err:?}");
}
