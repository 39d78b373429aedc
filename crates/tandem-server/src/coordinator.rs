//! Session coordination with a single-owner command loop.
//!
//! [`SessionCoordinator`] owns the connection table and every registry. It
//! runs inside one dedicated tokio task (see [`spawn_coordinator`]); socket
//! tasks and HTTP handlers reach it only through [`CoordinatorHandle`], so
//! each connect, frame and disconnect is applied in full before the next one
//! starts and the registries never need locks.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use tandem_shared::chunk::ContentChunker;
use tandem_shared::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_HISTORY_LIMIT};
use tandem_shared::protocol::{
    Ack, AssistanceJoined, EndAssistance, GetMessageHistory, HelperJoined, InboundEvent,
    JoinAssistance, MessageHistory, MessageReceived, MessageSent, OutboundEvent,
    RequestAssistance, SendMessage, SendTemplateContent, SwitchContentFile, SwitchFile,
};
use tandem_shared::types::{ConnectionId, TemplateContent, UserId};

use crate::assistance::AssistanceRegistry;
use crate::error::SessionError;
use crate::identity::{Identity, IdentityRegistry};
use crate::message_log::MessageLog;

/// Sending half of a connection's outbound frame queue.
pub type Outbound = mpsc::Sender<String>;

/// Tunables for the coordinator task.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Template content slice size, in characters.
    pub chunk_size: usize,
    /// Default number of messages returned by `get-message-history`.
    pub history_limit: usize,
    /// Depth of the command queue feeding the coordinator task.
    pub command_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            history_limit: DEFAULT_HISTORY_LIMIT,
            command_buffer: 1024,
        }
    }
}

/// Point-in-time counters, served on `/info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub connections: usize,
    pub identities: usize,
    pub open_requests: usize,
    pub messages: usize,
}

pub struct SessionCoordinator {
    connections: HashMap<ConnectionId, Outbound>,
    next_connection: u64,
    identities: IdentityRegistry,
    assistance: AssistanceRegistry,
    messages: MessageLog,
    chunker: ContentChunker,
    history_limit: usize,
}

impl SessionCoordinator {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            connections: HashMap::new(),
            next_connection: 1,
            identities: IdentityRegistry::new(),
            assistance: AssistanceRegistry::new(),
            messages: MessageLog::new(),
            chunker: ContentChunker::new(config.chunk_size),
            history_limit: config.history_limit,
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register a new transport channel and greet it with its identity.
    pub fn connect(&mut self, outbound: Outbound) -> ConnectionId {
        let connection_id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        self.connections.insert(connection_id, outbound);

        let identity = self.identities.create(connection_id);
        info!(
            connection = %connection_id,
            uuid = %identity.uuid,
            connections = self.connections.len(),
            "Client connected"
        );

        self.send(connection_id, &OutboundEvent::UserConnected(identity.info()));
        self.broadcast_list();
        connection_id
    }

    /// Decode and apply one inbound frame. Failures are answered with an
    /// `error` event to the sender only.
    pub fn handle_frame(&mut self, connection_id: ConnectionId, text: &str) {
        if !self.connections.contains_key(&connection_id) {
            debug!(connection = %connection_id, "Frame from unknown connection ignored");
            return;
        }

        if let Err(e) = self.dispatch(connection_id, text) {
            warn!(connection = %connection_id, error = %e, "Event rejected");
            self.send(connection_id, &OutboundEvent::error(e.to_string()));
        }
    }

    /// Tear down a connection and undo whatever pairing it took part in.
    ///
    /// The connection is dropped from the table first so that nothing is
    /// queued to a socket that is already gone.
    pub fn disconnect(&mut self, connection_id: ConnectionId) {
        let was_connected = self.connections.remove(&connection_id).is_some();

        if let Some(identity) = self.identities.get_by_connection(connection_id).cloned() {
            info!(
                connection = %connection_id,
                uuid = %identity.uuid,
                connected_secs = (chrono::Utc::now() - identity.connected_at).num_seconds(),
                "Client disconnected"
            );

            let was_requesting = self.assistance.is_requesting(&identity.uuid);
            if was_requesting {
                self.close_request(&identity.uuid);
            }
            // a requester may also be helping someone else
            let was_helping = self.assistance.get_by_helper(&identity.uuid).is_some();
            if was_helping {
                self.helper_left(&identity);
            }
            if was_requesting || was_helping {
                self.broadcast_list();
            }

            self.identities.remove(connection_id);
        } else if was_connected {
            debug!(connection = %connection_id, "Connection closed without identity");
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            connections: self.connections.len(),
            identities: self.identities.len(),
            open_requests: self.assistance.len(),
            messages: self.messages.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn dispatch(&mut self, connection_id: ConnectionId, text: &str) -> Result<(), SessionError> {
        let event = InboundEvent::decode(text)?;
        let sender = self
            .identities
            .get_by_connection(connection_id)
            .cloned()
            .ok_or(SessionError::UnknownIdentity)?;

        debug!(uuid = %sender.uuid, event = event.name(), "Handling event");

        match event {
            InboundEvent::RequestAssistance(data) => self.request_assistance(&sender, data),
            InboundEvent::JoinAssistance(data) => self.join_assistance(&sender, data),
            InboundEvent::SendTemplateContent(data) => self.send_template_content(&sender, data),
            InboundEvent::SwitchContentFile(data) => self.switch_content_file(&sender, data),
            InboundEvent::SendMessage(data) => self.send_message(&sender, data),
            InboundEvent::EndAssistance(data) => self.end_assistance(&sender, data),
            InboundEvent::GetAssistanceList => {
                self.send(
                    sender.connection_id,
                    &OutboundEvent::AssistanceList(self.assistance.list()),
                );
                Ok(())
            }
            InboundEvent::GetMessageHistory(data) => self.message_history(&sender, data),
        }
    }

    fn request_assistance(
        &mut self,
        sender: &Identity,
        data: RequestAssistance,
    ) -> Result<(), SessionError> {
        let template_id = data
            .template_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| sender.template_id.clone());
        let content = data
            .template_content
            .unwrap_or_else(|| TemplateContent::Text(String::new()));

        self.assistance
            .create(&mut self.identities, sender.uuid, template_id, content);

        self.broadcast_list();
        self.send(
            sender.connection_id,
            &OutboundEvent::AssistanceRequested(Ack::OK),
        );
        Ok(())
    }

    fn join_assistance(
        &mut self,
        helper: &Identity,
        data: JoinAssistance,
    ) -> Result<(), SessionError> {
        let requester = data.requester_uuid;
        let template_id = self
            .assistance
            .get(&requester)
            .map(|request| request.template_id.clone())
            .ok_or(SessionError::MissingRequest(requester))?;

        // a helper serves one request at a time
        let previous = self
            .assistance
            .get_by_helper(&helper.uuid)
            .map(|request| request.requester_uuid)
            .filter(|previous| *previous != requester);
        if let Some(previous) = previous {
            info!(helper = %helper.uuid, previous = %previous, "Helper moving to another request");
            self.helper_left(helper);
        }

        self.assistance.set_helper(&requester, helper.uuid);
        self.assistance.hide(&helper.uuid);
        self.identities.set_joining_help(&helper.uuid, true);
        self.broadcast_list();

        if let Some(connection_id) = self.connection_of(&requester) {
            self.send(
                connection_id,
                &OutboundEvent::HelperJoined(HelperJoined {
                    helper_uuid: helper.uuid,
                    template_id: template_id.clone(),
                }),
            );
        }
        self.send(
            helper.connection_id,
            &OutboundEvent::AssistanceJoined(AssistanceJoined {
                requester_uuid: requester,
                template_id,
            }),
        );

        info!(helper = %helper.uuid, requester = %requester, "Helper joined assistance");
        Ok(())
    }

    fn send_template_content(
        &mut self,
        sender: &Identity,
        data: SendTemplateContent,
    ) -> Result<(), SessionError> {
        let recipient = self
            .connection_of(&data.to_uuid)
            .ok_or(SessionError::MissingPeer(data.to_uuid))?;

        let chunks = self.chunker.split(
            &data.content,
            &data.template_id,
            sender.uuid,
            data.to_uuid,
            &data.path,
        )?;
        let count = chunks.len();

        for chunk in chunks {
            self.send(recipient, &OutboundEvent::TemplateContentChunk(chunk.into()));
        }

        info!(
            from = %sender.uuid,
            to = %data.to_uuid,
            chunks = count,
            "Template content relayed"
        );
        Ok(())
    }

    fn switch_content_file(
        &mut self,
        sender: &Identity,
        data: SwitchContentFile,
    ) -> Result<(), SessionError> {
        let recipient = self
            .connection_of(&data.to_uuid)
            .ok_or(SessionError::MissingPeer(data.to_uuid))?;

        info!(from = %sender.uuid, to = %data.to_uuid, path = %data.switch_file, "Switching file");
        self.send(
            recipient,
            &OutboundEvent::GetSwitchFile(SwitchFile {
                path: data.switch_file,
                template_id: data.template_id,
                from_uuid: sender.uuid,
                to_uuid: data.to_uuid,
            }),
        );
        Ok(())
    }

    fn send_message(&mut self, sender: &Identity, data: SendMessage) -> Result<(), SessionError> {
        let recipient = self
            .connection_of(&data.to_uuid)
            .ok_or(SessionError::MissingPeer(data.to_uuid))?;

        let message = self
            .messages
            .append(sender.uuid, data.to_uuid, data.content, data.template_id);

        self.send(
            recipient,
            &OutboundEvent::MessageReceived(MessageReceived {
                from_uuid: sender.uuid,
                content: message.content.clone(),
                timestamp: message.timestamp,
                template_id: message.template_id.clone(),
            }),
        );
        self.send(
            sender.connection_id,
            &OutboundEvent::MessageSent(MessageSent {
                to_uuid: message.to_uuid,
                content: message.content,
                timestamp: message.timestamp,
            }),
        );

        debug!(from = %sender.uuid, to = %data.to_uuid, "Chat message relayed");
        Ok(())
    }

    fn end_assistance(&mut self, sender: &Identity, data: EndAssistance) -> Result<(), SessionError> {
        let requester = data.requester_uuid.unwrap_or(sender.uuid);

        self.close_request(&requester);
        self.broadcast_list();

        if let Some(connection_id) = self.connection_of(&requester) {
            self.send(connection_id, &OutboundEvent::AssistanceEnded(Ack::OK));
        }
        Ok(())
    }

    fn message_history(
        &mut self,
        sender: &Identity,
        data: GetMessageHistory,
    ) -> Result<(), SessionError> {
        let limit = data.limit.unwrap_or(self.history_limit);
        let messages = self.messages.between(&sender.uuid, &data.with_uuid, limit);

        self.send(
            sender.connection_id,
            &OutboundEvent::MessageHistory(MessageHistory {
                with_uuid: data.with_uuid,
                messages,
            }),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pairing helpers
    // -----------------------------------------------------------------------

    /// End `requester`'s request and free its helper, if any.
    fn close_request(&mut self, requester: &UserId) {
        let ended = self
            .assistance
            .end_assistance(&mut self.identities, requester);

        if let Some(helper) = ended.and_then(|request| request.helper_uuid) {
            self.identities.set_joining_help(&helper, false);
        }
    }

    /// A helper dropped or moved on without ending the session: re-advertise
    /// the request and tell the requester.
    fn helper_left(&mut self, helper: &Identity) {
        self.assistance.show(&helper.uuid);
        let requester = self
            .assistance
            .get_by_helper(&helper.uuid)
            .map(|request| request.requester_uuid);
        self.assistance.release_helper(&helper.uuid);

        let Some(requester) = requester else {
            debug!(helper = %helper.uuid, "Departed helper had no paired request");
            return;
        };

        info!(helper = %helper.uuid, requester = %requester, "Helper left assistance");
        if let Some(connection_id) = self.connection_of(&requester) {
            self.send(connection_id, &OutboundEvent::HelperLeave(Ack::OK));
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    fn connection_of(&self, uuid: &UserId) -> Option<ConnectionId> {
        self.identities
            .get_by_uuid(uuid)
            .map(|identity| identity.connection_id)
    }

    fn broadcast_list(&self) {
        self.broadcast(&OutboundEvent::AssistanceListUpdated(self.assistance.list()));
    }

    fn send(&self, connection_id: ConnectionId, event: &OutboundEvent) {
        let Some(outbound) = self.connections.get(&connection_id) else {
            debug!(connection = %connection_id, event = event.name(), "No live connection, dropping");
            return;
        };

        match event.encode() {
            Ok(frame) => deliver(connection_id, outbound, frame),
            Err(e) => error!(event = event.name(), error = %e, "Failed to encode event"),
        }
    }

    fn broadcast(&self, event: &OutboundEvent) {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(event = event.name(), error = %e, "Failed to encode broadcast");
                return;
            }
        };

        for (connection_id, outbound) in &self.connections {
            deliver(*connection_id, outbound, frame.clone());
        }
    }
}

/// Best-effort: a full or closed queue drops the frame.
fn deliver(connection_id: ConnectionId, outbound: &Outbound, frame: String) {
    if let Err(e) = outbound.try_send(frame) {
        debug!(connection = %connection_id, reason = %e, "Dropping frame for unavailable connection");
    }
}

// ---------------------------------------------------------------------------
// Coordinator task
// ---------------------------------------------------------------------------

/// Commands sent *into* the coordinator task.
#[derive(Debug)]
pub enum CoordinatorCommand {
    /// A socket opened; reply with its connection id.
    Connect {
        outbound: Outbound,
        reply: oneshot::Sender<ConnectionId>,
    },
    /// A text frame arrived on a socket.
    Frame {
        connection_id: ConnectionId,
        text: String,
    },
    /// A socket closed.
    Disconnect { connection_id: ConnectionId },
    /// Request a snapshot of the session counters.
    Stats(oneshot::Sender<SessionStats>),
}

#[derive(Debug, thiserror::Error)]
#[error("Session coordinator has stopped")]
pub struct CoordinatorStopped;

/// Cloneable entry point to the coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    pub async fn connect(&self, outbound: Outbound) -> Result<ConnectionId, CoordinatorStopped> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::Connect { outbound, reply })
            .await
            .map_err(|_| CoordinatorStopped)?;
        rx.await.map_err(|_| CoordinatorStopped)
    }

    pub async fn frame(
        &self,
        connection_id: ConnectionId,
        text: String,
    ) -> Result<(), CoordinatorStopped> {
        self.tx
            .send(CoordinatorCommand::Frame {
                connection_id,
                text,
            })
            .await
            .map_err(|_| CoordinatorStopped)
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), CoordinatorStopped> {
        self.tx
            .send(CoordinatorCommand::Disconnect { connection_id })
            .await
            .map_err(|_| CoordinatorStopped)
    }

    pub async fn stats(&self) -> Result<SessionStats, CoordinatorStopped> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::Stats(reply))
            .await
            .map_err(|_| CoordinatorStopped)?;
        rx.await.map_err(|_| CoordinatorStopped)
    }
}

/// Spawn the coordinator in a background tokio task.
///
/// The task stops once every [`CoordinatorHandle`] has been dropped.
pub fn spawn_coordinator(config: CoordinatorConfig) -> CoordinatorHandle {
    let (tx, mut rx) = mpsc::channel::<CoordinatorCommand>(config.command_buffer.max(1));
    let mut coordinator = SessionCoordinator::new(&config);

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                CoordinatorCommand::Connect { outbound, reply } => {
                    let connection_id = coordinator.connect(outbound);
                    if reply.send(connection_id).is_err() {
                        // socket task gave up before learning its id
                        coordinator.disconnect(connection_id);
                    }
                }
                CoordinatorCommand::Frame {
                    connection_id,
                    text,
                } => coordinator.handle_frame(connection_id, &text),
                CoordinatorCommand::Disconnect { connection_id } => {
                    coordinator.disconnect(connection_id)
                }
                CoordinatorCommand::Stats(reply) => {
                    let _ = reply.send(coordinator.stats());
                }
            }
        }
        info!("Command channel closed, stopping session coordinator");
    });

    info!(
        chunk_size = config.chunk_size,
        history_limit = config.history_limit,
        "Session coordinator started"
    );
    CoordinatorHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_shared::protocol::{AssistanceSummary, ChunkFrame};

    struct Client {
        id: ConnectionId,
        rx: mpsc::Receiver<String>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<OutboundEvent> {
            let mut events = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                events.push(serde_json::from_str(&frame).unwrap());
            }
            events
        }
    }

    fn coordinator(chunk_size: usize) -> SessionCoordinator {
        SessionCoordinator::new(&CoordinatorConfig {
            chunk_size,
            ..CoordinatorConfig::default()
        })
    }

    /// Connects a client and returns it together with its uuid.
    fn join(coordinator: &mut SessionCoordinator) -> (Client, UserId) {
        let (tx, rx) = mpsc::channel(256);
        let id = coordinator.connect(tx);
        let mut client = Client { id, rx };
        let uuid = match client.drain().first() {
            Some(OutboundEvent::UserConnected(info)) => info.uuid,
            other => panic!("expected user-connected first, got {other:?}"),
        };
        (client, uuid)
    }

    fn send(coordinator: &mut SessionCoordinator, client: &Client, frame: serde_json::Value) {
        coordinator.handle_frame(client.id, &frame.to_string());
    }

    fn last_list(events: &[OutboundEvent]) -> Vec<AssistanceSummary> {
        events
            .iter()
            .rev()
            .find_map(|e| match e {
                OutboundEvent::AssistanceListUpdated(list) => Some(list.clone()),
                _ => None,
            })
            .expect("no list broadcast")
    }

    fn errors(events: &[OutboundEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                OutboundEvent::Error(payload) => Some(payload.message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_greets_then_broadcasts() {
        let mut c = coordinator(10);
        let (tx, mut rx) = mpsc::channel(16);
        c.connect(tx);

        let first: OutboundEvent = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let second: OutboundEvent = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        match first {
            OutboundEvent::UserConnected(info) => {
                assert_eq!(info.template_id, "");
                assert!(!info.is_requesting_help);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(second, OutboundEvent::AssistanceListUpdated(vec![]));
    }

    #[test]
    fn test_each_connection_gets_unique_uuid() {
        let mut c = coordinator(10);
        let uuids: Vec<UserId> = (0..20).map(|_| join(&mut c).1).collect();
        let mut deduped = uuids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), uuids.len());
        assert_eq!(c.stats().connections, 20);
    }

    #[test]
    fn test_pairing_scenario() {
        let mut c = coordinator(10);
        let (mut a, u1) = join(&mut c);

        send(&mut c, &a, json!({"event": "request-assistance", "data": {"templateId": "t1"}}));
        let events = a.drain();
        let list = last_list(&events);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].requester_uuid, u1);
        assert_eq!(list[0].template_id, "t1");
        assert!(list[0].show);
        assert!(events.contains(&OutboundEvent::AssistanceRequested(Ack::OK)));

        let (mut b, u2) = join(&mut c);
        a.drain();

        send(&mut c, &b, json!({"event": "join-assistance", "data": {"requesterUuid": u1}}));
        let a_events = a.drain();
        let b_events = b.drain();
        assert!(a_events.contains(&OutboundEvent::HelperJoined(HelperJoined {
            helper_uuid: u2,
            template_id: "t1".into(),
        })));
        assert!(b_events.contains(&OutboundEvent::AssistanceJoined(AssistanceJoined {
            requester_uuid: u1,
            template_id: "t1".into(),
        })));
        assert!(!last_list(&a_events)[0].show);
        assert!(!last_list(&b_events)[0].show);
        assert_eq!(
            c.assistance.get_by_helper(&u2).unwrap().requester_uuid,
            u1
        );

        c.disconnect(b.id);
        let a_events = a.drain();
        assert!(a_events.contains(&OutboundEvent::HelperLeave(Ack::OK)));
        let list = last_list(&a_events);
        assert_eq!(list[0].requester_uuid, u1);
        assert!(list[0].show);
        assert!(c.assistance.get_by_helper(&u2).is_none());
        assert!(b.drain().is_empty());
    }

    #[test]
    fn test_request_visible_in_list_for_any_client() {
        let mut c = coordinator(10);
        let (a, u1) = join(&mut c);
        let (mut other, _) = join(&mut c);

        send(&mut c, &a, json!({"event": "request-assistance", "data": {"templateId": "t9", "templateContent": "<p/>"}}));
        other.drain();
        send(&mut c, &other, json!({"event": "get-assistance-list"}));

        match other.drain().as_slice() {
            [OutboundEvent::AssistanceList(list)] => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].requester_uuid, u1);
                assert_eq!(list[0].template_content, TemplateContent::Text("<p/>".into()));
                assert!(list[0].show);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(c.assistance.get(&u1).unwrap().helper_uuid.is_none());
    }

    #[test]
    fn test_requester_disconnect_removes_request() {
        let mut c = coordinator(10);
        let (a, u1) = join(&mut c);
        let (mut b, u2) = join(&mut c);

        send(&mut c, &a, json!({"event": "request-assistance", "data": {"templateId": "t1"}}));
        send(&mut c, &b, json!({"event": "join-assistance", "data": {"requesterUuid": u1}}));
        b.drain();

        c.disconnect(a.id);
        assert!(last_list(&b.drain()).is_empty());
        assert!(!c.identities.get_by_uuid(&u2).unwrap().is_joining_help);

        send(&mut c, &b, json!({"event": "get-assistance-list"}));
        assert_eq!(b.drain(), vec![OutboundEvent::AssistanceList(vec![])]);
        assert_eq!(c.stats().identities, 1);
    }

    #[test]
    fn test_helper_moving_to_second_request() {
        let mut c = coordinator(10);
        let (mut r1, u1) = join(&mut c);
        let (mut r2, u2) = join(&mut c);
        let (h, uh) = join(&mut c);

        send(&mut c, &r1, json!({"event": "request-assistance", "data": {"templateId": "t1"}}));
        send(&mut c, &r2, json!({"event": "request-assistance", "data": {"templateId": "t2"}}));
        send(&mut c, &h, json!({"event": "join-assistance", "data": {"requesterUuid": u1}}));
        r1.drain();
        r2.drain();

        send(&mut c, &h, json!({"event": "join-assistance", "data": {"requesterUuid": u2}}));

        let r1_events = r1.drain();
        assert!(r1_events.contains(&OutboundEvent::HelperLeave(Ack::OK)));
        assert!(r2.drain().contains(&OutboundEvent::HelperJoined(HelperJoined {
            helper_uuid: uh,
            template_id: "t2".into(),
        })));

        let list = last_list(&r1_events);
        let entry = |uuid: UserId| list.iter().find(|e| e.requester_uuid == uuid).unwrap().show;
        assert!(entry(u1));
        assert!(!entry(u2));
        assert_eq!(c.assistance.get_by_helper(&uh).unwrap().requester_uuid, u2);
        assert!(!c.assistance.get(&u1).unwrap().is_paired());

        c.disconnect(h.id);
        assert!(r2.drain().contains(&OutboundEvent::HelperLeave(Ack::OK)));
        assert!(!r1.drain().contains(&OutboundEvent::HelperLeave(Ack::OK)));
        let request = c.assistance.get(&u2).unwrap();
        assert!(request.show);
        assert!(!request.is_paired());
    }

    #[test]
    fn test_rejoining_same_request_keeps_pairing() {
        let mut c = coordinator(10);
        let (mut r, u1) = join(&mut c);
        let (h, uh) = join(&mut c);

        send(&mut c, &r, json!({"event": "request-assistance", "data": {"templateId": "t1"}}));
        send(&mut c, &h, json!({"event": "join-assistance", "data": {"requesterUuid": u1}}));
        r.drain();
        send(&mut c, &h, json!({"event": "join-assistance", "data": {"requesterUuid": u1}}));

        assert!(!r.drain().contains(&OutboundEvent::HelperLeave(Ack::OK)));
        assert_eq!(c.assistance.get_by_helper(&uh).unwrap().requester_uuid, u1);
        assert!(!c.assistance.get(&u1).unwrap().show);
    }

    #[test]
    fn test_requester_who_also_helps_releases_both() {
        let mut c = coordinator(10);
        let (mut a, ua) = join(&mut c);
        let (b, ub) = join(&mut c);

        send(&mut c, &a, json!({"event": "request-assistance", "data": {"templateId": "ta"}}));
        send(&mut c, &b, json!({"event": "request-assistance", "data": {"templateId": "tb"}}));
        send(&mut c, &b, json!({"event": "join-assistance", "data": {"requesterUuid": ua}}));
        a.drain();

        c.disconnect(b.id);

        let events = a.drain();
        assert!(events.contains(&OutboundEvent::HelperLeave(Ack::OK)));
        let list = last_list(&events);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].requester_uuid, ua);
        assert!(list[0].show);
        assert!(!c.assistance.is_requesting(&ub));
        assert!(c.assistance.get_by_helper(&ub).is_none());
    }

    #[test]
    fn test_idle_disconnect_has_no_side_effects() {
        let mut c = coordinator(10);
        let (a, _) = join(&mut c);
        let (mut b, _) = join(&mut c);
        b.drain();

        c.disconnect(a.id);
        assert!(b.drain().is_empty());
        assert_eq!(c.stats().connections, 1);
    }

    #[test]
    fn test_message_to_missing_peer() {
        let mut c = coordinator(10);
        let (mut a, _) = join(&mut c);

        send(&mut c, &a, json!({"event": "send-message", "data": {"toUuid": UserId::new(), "content": "hi"}}));
        let events = a.drain();
        assert_eq!(errors(&events).len(), 1);
        assert_eq!(events.len(), 1);
        assert_eq!(c.messages.len(), 0);
    }

    #[test]
    fn test_message_relay() {
        let mut c = coordinator(10);
        let (mut a, u1) = join(&mut c);
        let (mut b, u2) = join(&mut c);
        a.drain();

        send(&mut c, &a, json!({"event": "send-message", "data": {"toUuid": u2, "content": "hello", "templateId": "t1"}}));

        match b.drain().as_slice() {
            [OutboundEvent::MessageReceived(m)] => {
                assert_eq!(m.from_uuid, u1);
                assert_eq!(m.content, "hello");
                assert_eq!(m.template_id, "t1");
            }
            other => panic!("unexpected {other:?}"),
        }
        match a.drain().as_slice() {
            [OutboundEvent::MessageSent(m)] => {
                assert_eq!(m.to_uuid, u2);
                assert_eq!(m.content, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.messages.between(&u1, &u2, 10).len(), 1);

        send(&mut c, &b, json!({"event": "get-message-history", "data": {"withUuid": u1}}));
        match b.drain().as_slice() {
            [OutboundEvent::MessageHistory(history)] => {
                assert_eq!(history.with_uuid, u1);
                assert_eq!(history.messages.len(), 1);
                assert_eq!(history.messages[0].content, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_template_content_chunks_in_order() {
        let mut c = coordinator(4);
        let (mut a, u1) = join(&mut c);
        let (mut b, u2) = join(&mut c);
        a.drain();

        send(&mut c, &a, json!({
            "event": "send-template-content",
            "data": {"content": "abcdefghij", "toUuid": u2, "path": "index.html", "templateId": "t1"}
        }));

        let chunks: Vec<ChunkFrame> = b
            .drain()
            .into_iter()
            .map(|e| match e {
                OutboundEvent::TemplateContentChunk(chunk) => chunk,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
            assert_eq!(chunk.total_chunks, 3);
            assert_eq!(chunk.from_uuid, u1);
            assert_eq!(chunk.path, "index.html");
        }
        let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(joined, "abcdefghij");
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_template_content_structured_payload() {
        let mut c = coordinator(1000);
        let (a, _) = join(&mut c);
        let (mut b, u2) = join(&mut c);

        b.drain();
        send(&mut c, &a, json!({
            "event": "send-template-content",
            "data": {"content": {"html": "<p/>"}, "toUuid": u2}
        }));

        match b.drain().as_slice() {
            [OutboundEvent::TemplateContentChunk(chunk)] => {
                assert_eq!(chunk.content, r#"{"html":"<p/>"}"#);
                assert_eq!(chunk.total_chunks, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_switch_file_and_missing_recipient() {
        let mut c = coordinator(10);
        let (mut a, u1) = join(&mut c);
        let (mut b, u2) = join(&mut c);
        a.drain();

        send(&mut c, &a, json!({"event": "switch-content-file", "data": {"switchFile": "style.css", "toUuid": u2, "templateId": "t1"}}));
        assert_eq!(
            b.drain(),
            vec![OutboundEvent::GetSwitchFile(SwitchFile {
                path: "style.css".into(),
                template_id: "t1".into(),
                from_uuid: u1,
                to_uuid: u2,
            })]
        );

        send(&mut c, &a, json!({"event": "switch-content-file", "data": {"switchFile": "x", "toUuid": UserId::new()}}));
        assert_eq!(errors(&a.drain()).len(), 1);
    }

    #[test]
    fn test_end_assistance_notifies_requester() {
        let mut c = coordinator(10);
        let (mut a, u1) = join(&mut c);
        let (mut b, u2) = join(&mut c);

        send(&mut c, &a, json!({"event": "request-assistance", "data": {"templateId": "t1"}}));
        send(&mut c, &b, json!({"event": "join-assistance", "data": {"requesterUuid": u1}}));
        a.drain();
        b.drain();

        send(&mut c, &b, json!({"event": "end-assistance", "data": {"requesterUuid": u1}}));
        let a_events = a.drain();
        assert!(a_events.contains(&OutboundEvent::AssistanceEnded(Ack::OK)));
        assert!(last_list(&a_events).is_empty());
        assert!(!b.drain().contains(&OutboundEvent::AssistanceEnded(Ack::OK)));
        assert!(!c.identities.get_by_uuid(&u1).unwrap().is_requesting_help);
        assert!(!c.identities.get_by_uuid(&u2).unwrap().is_joining_help);
    }

    #[test]
    fn test_end_assistance_defaults_to_sender() {
        let mut c = coordinator(10);
        let (mut a, u1) = join(&mut c);

        send(&mut c, &a, json!({"event": "request-assistance", "data": {}}));
        a.drain();
        send(&mut c, &a, json!({"event": "end-assistance"}));

        assert!(a.drain().contains(&OutboundEvent::AssistanceEnded(Ack::OK)));
        assert!(!c.assistance.is_requesting(&u1));
    }

    #[test]
    fn test_join_missing_request() {
        let mut c = coordinator(10);
        let (mut a, _) = join(&mut c);
        a.drain();

        send(&mut c, &a, json!({"event": "join-assistance", "data": {"requesterUuid": UserId::new()}}));
        assert_eq!(errors(&a.drain()).len(), 1);
    }

    #[test]
    fn test_bad_frames_only_reach_sender() {
        let mut c = coordinator(10);
        let (mut a, _) = join(&mut c);
        let (mut b, _) = join(&mut c);
        a.drain();

        c.handle_frame(a.id, "{{not json");
        send(&mut c, &a, json!({"event": "teleport", "data": {}}));
        send(&mut c, &a, json!({"event": "send-message", "data": {"content": "no recipient"}}));

        assert_eq!(errors(&a.drain()).len(), 3);
        assert!(b.drain().is_empty());

        // the connection keeps working afterwards
        send(&mut c, &a, json!({"event": "get-assistance-list"}));
        assert_eq!(a.drain(), vec![OutboundEvent::AssistanceList(vec![])]);
    }

    #[test]
    fn test_closed_connection_sends_are_dropped() {
        let mut c = coordinator(10);
        let (a, u1) = join(&mut c);
        let (b, _) = join(&mut c);
        let b_id = b.id;
        drop(b);

        send(&mut c, &a, json!({"event": "request-assistance", "data": {"templateId": "t1"}}));
        assert!(c.assistance.is_requesting(&u1));
        c.disconnect(b_id);
        assert_eq!(c.stats().connections, 1);
    }

    #[test]
    fn test_full_queue_drops_frames() {
        let mut c = coordinator(1);
        let (a, _) = join(&mut c);
        let (tx, mut rx) = mpsc::channel(2);
        let b_id = c.connect(tx);
        let u2 = c.identities.get_by_connection(b_id).unwrap().uuid;

        send(&mut c, &a, json!({"event": "send-template-content", "data": {"content": "abcdef", "toUuid": u2}}));

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[test]
    fn test_frames_from_unknown_connection_ignored() {
        let mut c = coordinator(10);
        c.handle_frame(ConnectionId(99), r#"{"event":"get-assistance-list"}"#);
        assert_eq!(c.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_coordinator_task_roundtrip() {
        let handle = spawn_coordinator(CoordinatorConfig::default());
        let (tx, mut rx) = mpsc::channel(16);

        let id = handle.connect(tx).await.unwrap();
        let greeting: OutboundEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(greeting, OutboundEvent::UserConnected(_)));
        let _list = rx.recv().await.unwrap();

        handle
            .frame(id, json!({"event": "request-assistance", "data": {"templateId": "t1"}}).to_string())
            .await
            .unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.open_requests, 1);

        handle.disconnect(id).await.unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.open_requests, 0);
        assert_eq!(stats.identities, 0);
    }
}
