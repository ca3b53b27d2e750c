//! Fragmenting datagram transport.
//!
//! The send path chunks a word payload into self-describing fragments of at
//! most [`packet::FRAGMENT_PAYLOAD_MAX`] bytes and fires them at the
//! configured destination. The receive path is a dedicated thread that
//! validates each inbound datagram (size, fragment fields, word alignment,
//! id filter, checksum) and appends the surviving payload words to a bounded
//! buffer which consumers drain with [`Transport::take_all`].
//!
//! Fragments are not reassembled across datagrams: payload words accumulate
//! in arrival order, so inbound command payloads must fit one datagram.

pub mod packet;

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::TrackConfig;

use self::packet::{xor_checksum, PacketHeader, FRAGMENT_PAYLOAD_MAX, HEADER_SIZE, MAX_DATAGRAM};

/// Upper bound on words retained in the receive buffer before datagrams are
/// dropped.
pub const RECV_BUFFER_MAX_WORDS: usize = 10_000;

/// Payloads beyond this are rejected outright.
pub const MAX_PAYLOAD_BYTES: usize = 1 << 30;

/// Pause between fragments of one payload to soften bursts.
const INTER_FRAGMENT_PAUSE: Duration = Duration::from_micros(100);

/// Socket read timeout; bounds how long the receive thread takes to observe
/// the stop flag.
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Transport failures reported to the immediate caller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("payload is empty")]
    EmptyPayload,

    #[error("payload of {size} bytes exceeds the {MAX_PAYLOAD_BYTES} byte limit")]
    PayloadTooLarge { size: usize },

    #[error("sending fragment {index}/{total}")]
    FragmentSend {
        index: u32,
        total: u32,
        #[source]
        source: io::Error,
    },

    #[error("binding receive socket on port {port}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("socket error")]
    Io(#[from] io::Error),
}

#[derive(Default)]
struct RecvShared {
    words: Mutex<Vec<u32>>,
    dropped: AtomicU64,
}

struct Receiver {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Datagram sender and filtered receiver.
///
/// Construction binds both sockets and starts the receive thread; dropping
/// the transport stops the thread and closes the sockets. `send` may be
/// called from any thread.
pub struct Transport {
    send_socket: UdpSocket,
    dest: Mutex<SocketAddr>,
    shared: Arc<RecvShared>,
    receiver: Mutex<Option<Receiver>>,
}

impl Transport {
    /// Bind sockets per `config` and start receiving.
    pub fn new(config: &TrackConfig) -> Result<Self, TransportError> {
        let send_socket = UdpSocket::bind(("0.0.0.0", 0))?;

        let transport = Self {
            send_socket,
            dest: Mutex::new(config.dst_addr()),
            shared: Arc::new(RecvShared::default()),
            receiver: Mutex::new(None),
        };
        transport.start_receiver(config)?;
        Ok(transport)
    }

    /// Send a word payload, fragmenting as needed.
    ///
    /// Stops at the first fragment that fails; fragments already sent are
    /// not recalled.
    pub fn send(&self, words: &[u32]) -> Result<(), TransportError> {
        if words.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        let total_size = words.len() * 4;
        if total_size > MAX_PAYLOAD_BYTES {
            return Err(TransportError::PayloadTooLarge { size: total_size });
        }

        let mut payload = Vec::with_capacity(total_size);
        for word in words {
            payload.extend_from_slice(&word.to_le_bytes());
        }

        let dest = *self.dest.lock();
        let total_fragments = total_size.div_ceil(FRAGMENT_PAYLOAD_MAX);

        let mut datagram = Vec::with_capacity(MAX_DATAGRAM);
        for (index, chunk) in payload.chunks(FRAGMENT_PAYLOAD_MAX).enumerate() {
            let header = PacketHeader::for_fragment(
                index as u32,
                total_fragments as u32,
                total_size as u32,
                chunk.len() as u32,
                xor_checksum(chunk),
            );

            datagram.clear();
            datagram.extend_from_slice(&header.encode());
            datagram.extend_from_slice(chunk);

            self.send_socket
                .send_to(&datagram, dest)
                .map_err(|source| TransportError::FragmentSend {
                    index: index as u32,
                    total: total_fragments as u32,
                    source,
                })?;

            if index + 1 < total_fragments {
                thread::sleep(INTER_FRAGMENT_PAUSE);
            }
        }

        debug!(total_size, total_fragments, "payload sent");
        Ok(())
    }

    /// Drain every buffered word, in arrival order. Non-blocking.
    pub fn take_all(&self) -> Vec<u32> {
        std::mem::take(&mut *self.shared.words.lock())
    }

    /// Datagrams dropped because the receive buffer was full.
    pub fn dropped_datagrams(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Stop the receive thread, rebind under `config`, clear the receive
    /// buffer, and start receiving again. Blocks until the old thread exits,
    /// which is bounded by the socket poll timeout.
    pub fn reload(&self, config: &TrackConfig) -> Result<(), TransportError> {
        self.stop_receiver();
        self.shared.words.lock().clear();
        *self.dest.lock() = config.dst_addr();
        self.start_receiver(config)
    }

    fn start_receiver(&self, config: &TrackConfig) -> Result<(), TransportError> {
        let socket =
            UdpSocket::bind(("0.0.0.0", config.recv_port)).map_err(|source| TransportError::Bind {
                port: config.recv_port,
                source,
            })?;
        socket.set_read_timeout(Some(RECV_POLL_TIMEOUT))?;

        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new().name("track-transport-recv".into()).spawn({
            let stop = Arc::clone(&stop);
            let shared = Arc::clone(&self.shared);
            let filters = config.recv_filters.clone();
            let port = config.recv_port;
            move || receive_loop(socket, port, filters, shared, stop)
        })?;

        *self.receiver.lock() = Some(Receiver { stop, handle });
        Ok(())
    }

    fn stop_receiver(&self) {
        if let Some(receiver) = self.receiver.lock().take() {
            receiver.stop.store(true, Ordering::SeqCst);
            if receiver.handle.join().is_err() {
                warn!("receive thread panicked");
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop_receiver();
    }
}

fn receive_loop(
    socket: UdpSocket,
    port: u16,
    filters: Vec<String>,
    shared: Arc<RecvShared>,
    stop: Arc<AtomicBool>,
) {
    debug!(port, "receive thread started");
    let mut buf = [0u8; MAX_DATAGRAM];

    while !stop.load(Ordering::SeqCst) {
        let size = match socket.recv_from(&mut buf) {
            Ok((size, _peer)) => size,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "datagram receive failed");
                thread::sleep(RECV_POLL_TIMEOUT);
                continue;
            }
        };

        handle_datagram(&buf[..size], &filters, &shared);
    }

    debug!(port, "receive thread stopped");
}

/// Validate one datagram and append its payload words to the receive buffer.
/// Every rejection is a silent drop with a log line.
fn handle_datagram(data: &[u8], filters: &[String], shared: &RecvShared) {
    let Ok(header) = PacketHeader::decode(data) else {
        debug!(size = data.len(), "datagram shorter than header, dropped");
        return;
    };
    let payload = &data[HEADER_SIZE..];

    if payload.len() != header.fragment_size as usize {
        warn!(
            header = header.fragment_size,
            actual = payload.len(),
            "fragment size mismatch, dropped",
        );
        return;
    }

    if header.fragment_index >= header.total_fragments {
        warn!(
            index = header.fragment_index,
            total = header.total_fragments,
            "fragment index out of range, dropped",
        );
        return;
    }

    if payload.len() % 4 != 0 {
        warn!(size = payload.len(), "payload not word aligned, dropped");
        return;
    }

    if !header.matches_filter(filters) {
        debug!(id = %header.id_text(), "packet id not in filter set, dropped");
        return;
    }

    let computed = xor_checksum(payload);
    if computed != header.checksum {
        warn!(
            header = header.checksum,
            computed, "checksum mismatch, dropped",
        );
        return;
    }

    let count = payload.len() / 4;
    let mut words = shared.words.lock();
    if words.len() + count > RECV_BUFFER_MAX_WORDS {
        shared.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            buffered = words.len(),
            incoming = count,
            "receive buffer full, datagram dropped",
        );
        return;
    }
    words.extend(
        payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
    );
}
