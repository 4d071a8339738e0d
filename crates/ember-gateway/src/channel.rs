use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use ember_types::Topic;
use ember_types::events::{InboundFrame, OutboundFrame};

use crate::error::ChannelError;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const NO_STATUS_CLOSURE: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Application close code used when no access credential was available.
pub const UNAUTHORIZED_CLOSURE: u16 = 4401;

pub(crate) const REASON_UNMOUNT: &str = "component unmount";
pub(crate) const REASON_DISABLED: &str = "disabled";
pub(crate) const REASON_TOPIC_CHANGE: &str = "topic change";

/// Lifecycle of one channel.
///
/// `Idle -> Connecting -> Open -> Closing -> Closed`, with `Connecting -> Closed`
/// when the credential is missing or the handshake fails. A `Closed` channel
/// starts a new cycle when it is re-enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn is_normal(&self) -> bool {
        self.code == NORMAL_CLOSURE
    }
}

/// What a channel reports to its owner. Per connection cycle, `Open` and
/// `Closed` are each delivered at most once, and `Closed` is always last.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Frame(InboundFrame),
    Closed(CloseInfo),
}

pub(crate) struct Envelope {
    pub generation: u64,
    pub event: ChannelEvent,
}

pub(crate) enum Control {
    Enable,
    Disable,
    Topic(Topic),
    Send(OutboundFrame),
}

/// State shared between a handle, its driver task and the manager.
pub(crate) struct Shared {
    pub state: watch::Sender<ChannelState>,
    pub generation: AtomicU64,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ChannelState::Idle),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidates every frame already queued for the owner.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks a live connection as closing before the driver gets to it, so
    /// no caller observes `Open` once teardown was asked for.
    pub fn request_close(&self) {
        self.bump_generation();
        self.state.send_if_modified(|state| {
            if matches!(state, ChannelState::Open | ChannelState::Connecting) {
                *state = ChannelState::Closing;
                true
            } else {
                false
            }
        });
    }

    /// Blocks until the driver reports `Closed` or goes away.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
    }
}

/// Owner side of a channel. Dropping the handle closes the channel.
pub struct ChannelHandle {
    id: Uuid,
    topic: Topic,
    enabled: bool,
    control: mpsc::UnboundedSender<Control>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl ChannelHandle {
    pub(crate) fn new(
        id: Uuid,
        topic: Topic,
        enabled: bool,
        control: mpsc::UnboundedSender<Control>,
        shared: Arc<Shared>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            topic,
            enabled,
            control,
            shared,
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Enabling a channel that is idle or closed starts a connection cycle.
    /// Disabling an open or connecting channel closes it with code 1000.
    pub fn set_enabled(&mut self, enabled: bool) {
        if !enabled {
            // Frames already in flight belong to the cycle being closed
            self.shared.bump_generation();
        }
        self.enabled = enabled;
        let control = if enabled {
            Control::Enable
        } else {
            Control::Disable
        };
        let _ = self.control.send(control);
    }

    /// Closes the current connection, if any, and reconnects on the new topic
    /// while enabled.
    pub fn set_topic(&mut self, topic: Topic) {
        if topic == self.topic {
            return;
        }
        self.shared.bump_generation();
        self.topic = topic.clone();
        let _ = self.control.send(Control::Topic(topic));
    }

    pub fn send(&self, frame: OutboundFrame) -> Result<(), ChannelError> {
        send_frame(&self.control, &self.shared, frame)
    }

    /// Cloneable send-only view of this channel.
    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            control: self.control.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Closes the channel and waits for the driver to reach `Closed`.
    pub async fn close(self) {
        let shared = self.shared.clone();
        drop(self);
        shared.wait_closed().await;
    }

    fn shutdown(&self) {
        self.shared.request_close();
        self.cancel.cancel();
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        debug!(channel = %self.id, topic = %self.topic, "Channel handle dropped");
        self.shutdown();
    }
}

#[derive(Clone)]
pub struct ChannelSender {
    control: mpsc::UnboundedSender<Control>,
    shared: Arc<Shared>,
}

impl ChannelSender {
    pub fn send(&self, frame: OutboundFrame) -> Result<(), ChannelError> {
        send_frame(&self.control, &self.shared, frame)
    }
}

fn send_frame(
    control: &mpsc::UnboundedSender<Control>,
    shared: &Shared,
    frame: OutboundFrame,
) -> Result<(), ChannelError> {
    if shared.state() != ChannelState::Open {
        return Err(ChannelError::NotOpen);
    }
    control
        .send(Control::Send(frame))
        .map_err(|_| ChannelError::Stopped)
}

/// Receiving side of a channel: the single consumer of its events.
pub struct ChannelEvents {
    rx: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<Shared>,
}

impl ChannelEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Envelope>, shared: Arc<Shared>) -> Self {
        Self { rx, shared }
    }

    /// Next event, or `None` once the driver has exited and the queue is
    /// drained. Frames from a superseded cycle are skipped.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            let envelope = self.rx.recv().await?;
            if let Some(event) = self.admit(envelope) {
                return Some(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        loop {
            let envelope = self.rx.try_recv().ok()?;
            if let Some(event) = self.admit(envelope) {
                return Some(event);
            }
        }
    }

    fn admit(&self, envelope: Envelope) -> Option<ChannelEvent> {
        match envelope.event {
            ChannelEvent::Frame(_) if envelope.generation != self.shared.generation() => {
                debug!("Dropping frame from a superseded connection");
                None
            }
            event => Some(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::PeerId;
    use ember_types::events::Notification;

    fn pair() -> (
        ChannelHandle,
        ChannelEvents,
        mpsc::UnboundedSender<Envelope>,
        mpsc::UnboundedReceiver<Control>,
    ) {
        let shared = Arc::new(Shared::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle::new(
            Uuid::new_v4(),
            Topic::notifications(),
            true,
            control_tx,
            shared.clone(),
            CancellationToken::new(),
        );
        (handle, ChannelEvents::new(event_rx, shared), event_tx, control_rx)
    }

    fn frame() -> ChannelEvent {
        ChannelEvent::Frame(InboundFrame::Notification(Notification::Match { id: PeerId(1) }))
    }

    #[test]
    fn stale_frames_are_skipped_but_close_is_kept() {
        let (mut handle, mut events, tx, _control) = pair();
        tx.send(Envelope { generation: 0, event: frame() }).unwrap();
        handle.set_enabled(false);
        tx.send(Envelope {
            generation: 0,
            event: ChannelEvent::Closed(CloseInfo::new(NORMAL_CLOSURE, REASON_DISABLED)),
        })
        .unwrap();

        assert!(matches!(events.try_recv(), Some(ChannelEvent::Closed(c)) if c.is_normal()));
        assert!(events.try_recv().is_none());
    }

    #[test]
    fn send_requires_open() {
        let (handle, _events, _tx, mut control) = pair();
        let frame = OutboundFrame::Chat { text: "hi".into() };
        assert!(matches!(handle.send(frame.clone()), Err(ChannelError::NotOpen)));

        handle.shared.set_state(ChannelState::Open);
        handle.sender().send(frame).unwrap();
        assert!(matches!(control.try_recv(), Ok(Control::Send(_))));
    }

    #[test]
    fn drop_requests_close_synchronously() {
        let (handle, _events, _tx, _control) = pair();
        let shared = handle.shared.clone();
        let cancel = handle.cancel.clone();
        shared.set_state(ChannelState::Open);

        drop(handle);
        assert_eq!(shared.state(), ChannelState::Closing);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn same_topic_is_a_no_op() {
        let (mut handle, _events, _tx, mut control) = pair();
        let before = handle.shared.generation();
        handle.set_topic(Topic::notifications());
        assert_eq!(handle.shared.generation(), before);
        assert!(control.try_recv().is_err());

        handle.set_topic(Topic::messages(PeerId(3)));
        assert_eq!(handle.shared.generation(), before + 1);
        assert!(matches!(control.try_recv(), Ok(Control::Topic(_))));
    }
}
