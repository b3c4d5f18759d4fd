//! Frame transports a connection runs over.
//!
//! The runtime never looks inside a frame; it only needs an ordered,
//! reliable stream of byte frames in each direction. Real transports
//! (WebSocket, SSE, ...) implement [`FrameSource`] and [`FrameSink`]; the
//! in-process [`Transport::pair`] is what tests and [`LocalClient`] use.
//!
//! [`LocalClient`]: crate::client::LocalClient

use std::future::Future;

use tokio::sync::mpsc;

pub const TRANSPORT_CAPACITY_DEFAULT: usize = 64;

/// The transport is gone, no more frames can be written.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Transport closed")]
pub struct TransportClosed;

/// Inbound frames. `None` means the peer closed the transport.
///
/// `recv` must be cancel safe: the connection task polls it inside `select!`.
pub trait FrameSource: Send + 'static {
	fn recv(&mut self) -> impl Future<Output = Option<Vec<u8>>> + Send;
}

/// Outbound frames, written in call order.
pub trait FrameSink: Send + 'static {
	fn send(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<(), TransportClosed>> + Send;
}

impl FrameSource for mpsc::Receiver<Vec<u8>> {
	async fn recv(&mut self) -> Option<Vec<u8>> {
		mpsc::Receiver::recv(self).await
	}
}

impl FrameSink for mpsc::Sender<Vec<u8>> {
	async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportClosed> {
		mpsc::Sender::send(self, frame)
			.await
			.map_err(|_| TransportClosed)
	}
}

impl FrameSink for mpsc::UnboundedSender<Vec<u8>> {
	async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportClosed> {
		mpsc::UnboundedSender::send(self, frame).map_err(|_| TransportClosed)
	}
}

/// Client side of an in-process duplex.
#[derive(Debug)]
pub struct ClientEnd {
	pub tx: mpsc::Sender<Vec<u8>>,
	pub rx: mpsc::Receiver<Vec<u8>>,
}

/// Server side of an in-process duplex, handed to the connection task.
#[derive(Debug)]
pub struct ServerEnd {
	pub rx: mpsc::Receiver<Vec<u8>>,
	pub tx: mpsc::Sender<Vec<u8>>,
}

pub struct Transport;

impl Transport {
	/// Two connected ends, each direction bounded to `capacity` frames.
	pub fn pair(capacity: usize) -> (ClientEnd, ServerEnd) {
		let (client_tx, server_rx) = mpsc::channel(capacity);
		let (server_tx, client_rx) = mpsc::channel(capacity);
		(
			ClientEnd {
				tx: client_tx,
				rx: client_rx,
			},
			ServerEnd {
				rx: server_rx,
				tx: server_tx,
			},
		)
	}
}
