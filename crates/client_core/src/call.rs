use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use shared::{
    domain::{CallType, UserId},
    protocol::{user_call_queue, CallFrame, CallFrameKind, IceCandidate, SessionDescription},
};

use crate::{
    codec::{self, CallSignal, OutboundIntent},
    error::{CallError, MediaAccessError},
    transport::BrokerTransport,
    CallStateKind, SessionEvent,
};

/// A local or remote media stream. Track toggles are synchronous flips on
/// the underlying device handles.
pub trait MediaStream: Send + Sync {
    fn set_audio_enabled(&self, enabled: bool);
    fn set_video_enabled(&self, enabled: bool);
    fn stop(&self);
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, call_type: CallType) -> Result<Arc<dyn MediaStream>, MediaAccessError>;
}

#[derive(Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(Arc<dyn MediaStream>),
    ConnectionLost,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn attach_local(&self, stream: Arc<dyn MediaStream>) -> Result<(), CallError>;
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), CallError>;
}

/// Placeholder media source for frontends without capture devices wired up.
pub struct UnavailableMediaSource;

#[async_trait]
impl MediaSource for UnavailableMediaSource {
    async fn acquire(
        &self,
        call_type: CallType,
    ) -> Result<Arc<dyn MediaStream>, MediaAccessError> {
        let device = match call_type {
            CallType::Audio => "microphone",
            CallType::Video => "camera",
        };
        Err(MediaAccessError::NoDevice(device.to_string()))
    }
}

/// Placeholder peer connector for frontends without a WebRTC backend.
pub struct UnavailablePeerConnector;

#[async_trait]
impl PeerConnector for UnavailablePeerConnector {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), CallError> {
        Err(CallError::Peer("no peer connection backend".to_string()))
    }
}

#[derive(Clone)]
enum CallPhase {
    Idle,
    Outgoing {
        remote: UserId,
        call_type: CallType,
    },
    Incoming {
        /// Held while ringing; taken when the call is accepted.
        offer: Option<CallFrame>,
        remote: UserId,
        call_type: CallType,
    },
    Connected {
        remote: UserId,
        started_at: Instant,
    },
}

struct CallSession {
    phase: CallPhase,
    media: Option<Arc<dyn MediaStream>>,
    peer: Option<Arc<dyn PeerConnection>>,
    remote_media: Option<Arc<dyn MediaStream>>,
    /// Candidates that arrived before the remote description was applied.
    pending_ice: Vec<IceCandidate>,
    remote_description_set: bool,
    muted: bool,
    video_enabled: bool,
    event_task: Option<JoinHandle<()>>,
}

impl Default for CallSession {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            media: None,
            peer: None,
            remote_media: None,
            pending_ice: Vec::new(),
            remote_description_set: false,
            muted: false,
            video_enabled: true,
            event_task: None,
        }
    }
}

/// One-call-at-a-time signaling state machine over the broker's call
/// queue. Media and peer connections come in through trait seams so the
/// engine is testable without devices or a WebRTC stack.
pub struct CallEngine {
    media: Arc<dyn MediaSource>,
    peers: Arc<dyn PeerConnector>,
    transport: Arc<BrokerTransport>,
    user_id: UserId,
    display_name: String,
    inner: Mutex<CallSession>,
    events: broadcast::Sender<SessionEvent>,
}

impl CallEngine {
    pub fn new(
        media: Arc<dyn MediaSource>,
        peers: Arc<dyn PeerConnector>,
        transport: Arc<BrokerTransport>,
        user_id: UserId,
        display_name: String,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            media,
            peers,
            transport,
            user_id,
            display_name,
            inner: Mutex::new(CallSession::default()),
            events,
        })
    }

    /// Subscribes the per-user call queue and spawns its routing task.
    /// Must run again after every reconnect.
    pub async fn attach_call_queue(self: &Arc<Self>) {
        let topic = user_call_queue(&self.user_id);
        let mut rx = self.transport.subscribe(&topic).await;
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(body) = rx.recv().await {
                match codec::decode_call(&topic, body) {
                    Ok(Some(signal)) => engine.on_call_signal(signal).await,
                    Ok(None) => {}
                    Err(err) => warn!("{err}"),
                }
            }
        });
    }

    /// Starts an outgoing call. Media acquisition failure aborts before any
    /// signaling leaves the client; a peer setup failure after that releases
    /// the acquired devices and lands back in idle.
    pub async fn initiate_call(
        self: &Arc<Self>,
        remote: UserId,
        call_type: CallType,
    ) -> Result<(), CallError> {
        let mut session = self.inner.lock().await;
        if !matches!(session.phase, CallPhase::Idle) {
            return Err(CallError::Busy);
        }

        let media = self.media.acquire(call_type).await?;
        let created = match self.open_peer(&mut session, media).await {
            Ok(peer) => peer.create_offer().await,
            Err(err) => Err(err),
        };
        let offer = match created {
            Ok(offer) => offer,
            Err(err) => {
                self.teardown(&mut session, true).await;
                return Err(err);
            }
        };

        session.muted = false;
        session.video_enabled = matches!(call_type, CallType::Video);
        session.phase = CallPhase::Outgoing {
            remote: remote.clone(),
            call_type,
        };
        drop(session);

        let mut frame = CallFrame::event(CallFrameKind::Offer, self.user_id.clone(), remote);
        frame.sender_name = Some(self.display_name.clone());
        frame.offer = Some(offer);
        frame.call_type = Some(call_type);
        self.publish(OutboundIntent::CallOffer(frame)).await;
        let _ = self
            .events
            .send(SessionEvent::CallStateChanged(CallStateKind::Outgoing));
        Ok(())
    }

    /// Answers the pending incoming call. Buffered remote candidates are
    /// applied in arrival order once the remote description is set. Any
    /// setup failure tears the session down to idle, devices included.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let mut session = self.inner.lock().await;
        let (offer_frame, remote, call_type) = match &mut session.phase {
            CallPhase::Incoming {
                offer,
                remote,
                call_type,
            } => match offer.take() {
                Some(frame) => (frame, remote.clone(), *call_type),
                None => return Err(CallError::NoPendingCall),
            },
            _ => return Err(CallError::NoPendingCall),
        };

        let answer = match self.answer_offer(&mut session, offer_frame, call_type).await {
            Ok(answer) => answer,
            Err(err) => {
                self.teardown(&mut session, true).await;
                return Err(err);
            }
        };
        session.muted = false;
        session.video_enabled = matches!(call_type, CallType::Video);
        drop(session);

        let mut frame = CallFrame::event(CallFrameKind::Answer, self.user_id.clone(), remote);
        frame.answer = Some(answer);
        self.publish(OutboundIntent::CallAnswer(frame)).await;
        Ok(())
    }

    /// Creates the peer connection and wires the local stream into it. The
    /// media, the peer and its event pump are recorded in the session before
    /// anything fallible runs, so a failed setup tears down through the
    /// normal path.
    async fn open_peer(
        self: &Arc<Self>,
        session: &mut CallSession,
        media: Arc<dyn MediaStream>,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        session.media = Some(Arc::clone(&media));
        let (peer, peer_events) = self.peers.create().await?;
        session.peer = Some(Arc::clone(&peer));
        session.event_task = Some(self.spawn_peer_pump(peer_events));
        peer.attach_local(media).await?;
        Ok(peer)
    }

    async fn answer_offer(
        self: &Arc<Self>,
        session: &mut CallSession,
        offer_frame: CallFrame,
        call_type: CallType,
    ) -> Result<SessionDescription, CallError> {
        let remote_description = offer_frame
            .offer
            .ok_or_else(|| CallError::Peer("offer frame without sdp".to_string()))?;
        let media = self.media.acquire(call_type).await?;
        let peer = self.open_peer(session, media).await?;
        peer.set_remote_description(remote_description).await?;
        session.remote_description_set = true;
        for candidate in session.pending_ice.drain(..).collect::<Vec<_>>() {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!("failed to apply buffered candidate: {err}");
            }
        }
        peer.create_answer().await
    }

    /// Declines the pending incoming call without acquiring media.
    pub async fn reject_call(self: &Arc<Self>) -> Result<(), CallError> {
        let mut session = self.inner.lock().await;
        let remote = match &session.phase {
            CallPhase::Incoming { remote, .. } => remote.clone(),
            _ => return Err(CallError::NoPendingCall),
        };
        self.teardown(&mut session, true).await;
        drop(session);

        self.publish(OutboundIntent::CallEvent(CallFrame::event(
            CallFrameKind::Reject,
            self.user_id.clone(),
            remote,
        )))
        .await;
        let _ = self
            .events
            .send(SessionEvent::CallStateChanged(CallStateKind::Idle));
        Ok(())
    }

    /// Hangs up whatever call is in progress. A no-op when idle.
    pub async fn end_call(self: &Arc<Self>) {
        let mut session = self.inner.lock().await;
        let remote = match &session.phase {
            CallPhase::Idle => return,
            CallPhase::Outgoing { remote, .. }
            | CallPhase::Incoming { remote, .. }
            | CallPhase::Connected { remote, .. } => remote.clone(),
        };
        self.teardown(&mut session, true).await;
        drop(session);

        self.publish(OutboundIntent::CallEvent(CallFrame::event(
            CallFrameKind::Hangup,
            self.user_id.clone(),
            remote,
        )))
        .await;
        let _ = self
            .events
            .send(SessionEvent::CallStateChanged(CallStateKind::Ended));
    }

    async fn on_call_signal(self: &Arc<Self>, signal: CallSignal) {
        match signal {
            CallSignal::Offer(frame) => self.on_offer(frame).await,
            CallSignal::Answer(frame) => self.on_answer(frame).await,
            CallSignal::Candidate(frame) => self.on_candidate(frame).await,
            CallSignal::End(frame) => self.on_end(frame).await,
            CallSignal::Ringing(frame) | CallSignal::Busy(frame) | CallSignal::Reconnect(frame) => {
                let _ = self.events.send(SessionEvent::CallNotice(frame.kind));
            }
        }
    }

    async fn on_offer(self: &Arc<Self>, frame: CallFrame) {
        let mut session = self.inner.lock().await;
        if !matches!(session.phase, CallPhase::Idle) {
            warn!(from = %frame.from_user_id, "offer while already in a call, ignoring");
            return;
        }
        let from = frame.from_user_id.clone();
        let sender_name = frame.sender_name.clone();
        let call_type = frame.call_type.unwrap_or(CallType::Audio);
        session.phase = CallPhase::Incoming {
            offer: Some(frame),
            remote: from.clone(),
            call_type,
        };
        drop(session);

        info!(from = %from, "incoming call");
        let _ = self.events.send(SessionEvent::IncomingCall {
            from,
            sender_name,
            call_type,
        });
        let _ = self
            .events
            .send(SessionEvent::CallStateChanged(CallStateKind::Incoming));
    }

    async fn on_answer(self: &Arc<Self>, frame: CallFrame) {
        let mut session = self.inner.lock().await;
        if !matches!(session.phase, CallPhase::Outgoing { .. }) {
            warn!(from = %frame.from_user_id, "answer without outgoing call, ignoring");
            return;
        }
        let Some(answer) = frame.answer else {
            warn!(from = %frame.from_user_id, "answer frame without sdp, ignoring");
            return;
        };
        let Some(peer) = session.peer.clone() else {
            return;
        };
        if let Err(err) = peer.set_remote_description(answer).await {
            warn!("failed to apply remote answer: {err}");
            return;
        }
        session.remote_description_set = true;
        for candidate in session.pending_ice.drain(..).collect::<Vec<_>>() {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!("failed to apply buffered candidate: {err}");
            }
        }
    }

    async fn on_candidate(self: &Arc<Self>, frame: CallFrame) {
        let Some(candidate) = frame.candidate else {
            warn!(from = %frame.from_user_id, "candidate frame without payload, ignoring");
            return;
        };
        let mut session = self.inner.lock().await;
        if matches!(session.phase, CallPhase::Idle) {
            debug!("candidate while idle, dropping");
            return;
        }
        if session.remote_description_set {
            if let Some(peer) = session.peer.clone() {
                if let Err(err) = peer.add_ice_candidate(candidate).await {
                    warn!("failed to apply remote candidate: {err}");
                }
            }
        } else {
            session.pending_ice.push(candidate);
        }
    }

    async fn on_end(self: &Arc<Self>, frame: CallFrame) {
        let mut session = self.inner.lock().await;
        if matches!(session.phase, CallPhase::Idle) {
            return;
        }
        info!(from = %frame.from_user_id, "remote ended the call");
        self.teardown(&mut session, true).await;
        drop(session);
        let _ = self
            .events
            .send(SessionEvent::CallStateChanged(CallStateKind::Ended));
    }

    fn spawn_peer_pump(
        self: &Arc<Self>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                engine.on_peer_event(event).await;
            }
        })
    }

    async fn on_peer_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let session = self.inner.lock().await;
                let remote = match &session.phase {
                    CallPhase::Idle => return,
                    CallPhase::Outgoing { remote, .. }
                    | CallPhase::Incoming { remote, .. }
                    | CallPhase::Connected { remote, .. } => remote.clone(),
                };
                drop(session);
                let mut frame =
                    CallFrame::event(CallFrameKind::Candidate, self.user_id.clone(), remote);
                frame.candidate = Some(candidate);
                self.publish(OutboundIntent::CallCandidate(frame)).await;
            }
            PeerEvent::RemoteTrack(stream) => {
                let mut session = self.inner.lock().await;
                let remote = match &session.phase {
                    CallPhase::Outgoing { remote, .. } | CallPhase::Incoming { remote, .. } => {
                        remote.clone()
                    }
                    CallPhase::Connected { .. } => {
                        session.remote_media = Some(stream);
                        return;
                    }
                    CallPhase::Idle => return,
                };
                session.remote_media = Some(stream);
                // First remote media is what makes the call real.
                session.phase = CallPhase::Connected {
                    remote,
                    started_at: Instant::now(),
                };
                drop(session);
                let _ = self
                    .events
                    .send(SessionEvent::CallStateChanged(CallStateKind::Connected));
            }
            PeerEvent::ConnectionLost => {
                let mut session = self.inner.lock().await;
                if matches!(session.phase, CallPhase::Idle) {
                    return;
                }
                warn!("peer connection lost, ending call");
                self.teardown(&mut session, false).await;
                drop(session);
                let _ = self
                    .events
                    .send(SessionEvent::CallStateChanged(CallStateKind::Ended));
            }
        }
    }

    async fn teardown(&self, session: &mut CallSession, abort_pump: bool) {
        if let Some(media) = session.media.take() {
            media.stop();
        }
        session.remote_media = None;
        if let Some(peer) = session.peer.take() {
            peer.close().await;
        }
        if let Some(task) = session.event_task.take() {
            if abort_pump {
                task.abort();
            }
        }
        session.pending_ice.clear();
        session.remote_description_set = false;
        session.muted = false;
        session.video_enabled = true;
        session.phase = CallPhase::Idle;
    }

    /// Flips the outgoing audio track. Returns the new muted state.
    pub async fn toggle_mute(&self) -> bool {
        let mut session = self.inner.lock().await;
        session.muted = !session.muted;
        if let Some(media) = &session.media {
            media.set_audio_enabled(!session.muted);
        }
        session.muted
    }

    /// Flips the outgoing video track. Returns whether video is now on.
    pub async fn toggle_video(&self) -> bool {
        let mut session = self.inner.lock().await;
        session.video_enabled = !session.video_enabled;
        if let Some(media) = &session.media {
            media.set_video_enabled(session.video_enabled);
        }
        session.video_enabled
    }

    pub async fn state(&self) -> CallStateKind {
        match self.inner.lock().await.phase {
            CallPhase::Idle => CallStateKind::Idle,
            CallPhase::Outgoing { .. } => CallStateKind::Outgoing,
            CallPhase::Incoming { .. } => CallStateKind::Incoming,
            CallPhase::Connected { .. } => CallStateKind::Connected,
        }
    }

    /// Elapsed time since the first remote track, `None` until connected.
    pub async fn call_duration(&self) -> Option<Duration> {
        match self.inner.lock().await.phase {
            CallPhase::Connected { started_at, .. } => Some(started_at.elapsed()),
            _ => None,
        }
    }

    async fn publish(&self, intent: OutboundIntent) {
        match codec::encode_outbound(&intent) {
            Ok(frame) => self.transport.publish(&frame.topic, frame.body).await,
            Err(err) => warn!("failed to encode call frame: {err}"),
        }
    }
}

/// Renders a call duration the way the in-call timer shows it: minutes and
/// seconds, zero-padded.
pub fn format_call_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{:02}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
