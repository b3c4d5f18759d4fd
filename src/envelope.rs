use std::fmt::Debug;

use tokio::sync::oneshot;

/// A request travelling through an instance mailbox with its reply slot.
pub struct Envelope<T, R> {
	pub value: T,
	pub reply: oneshot::Sender<R>,
}

impl<T: Debug, R> Debug for Envelope<T, R> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		Debug::fmt(&self.value, f)
	}
}

impl<T, R> Envelope<T, R> {
	pub fn new(value: T) -> (Self, oneshot::Receiver<R>) {
		let (reply, rx) = oneshot::channel();
		(Self { value, reply }, rx)
	}

	/// Answer the request. The caller may have stopped waiting, in which case
	/// the reply is handed back.
	pub fn send(self, value: R) -> Result<(), R> {
		self.reply.send(value)
	}

	pub fn split(self) -> (T, oneshot::Sender<R>) {
		(self.value, self.reply)
	}

	pub fn is_abandoned(&self) -> bool {
		self.reply.is_closed()
	}
}
