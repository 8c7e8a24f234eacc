//! Per-peer message cache and its reconciliation rules.
//!
//! A [`Conversation`] holds the messages exchanged with one peer, oldest
//! first. It changes in three ways:
//! - [`reconcile`](Conversation::reconcile): a server snapshot replaces the
//!   list; unconfirmed local sends and read acknowledgements survive
//! - [`insert_sent`](Conversation::insert_sent): a just-sent message is
//!   placed at its chronological position
//! - read-receipt bookkeeping: [`begin_receipts`](Conversation::begin_receipts),
//!   [`acknowledge_read`](Conversation::acknowledge_read),
//!   [`receipt_failed`](Conversation::receipt_failed)

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use casedesk_proto::ids::{MessageId, UserId};
use casedesk_proto::message::{MessageStatus, RawMessage};

/// Who wrote a message, relative to the authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    /// The authenticated user.
    Me,
    /// The conversation peer (or a broadcaster).
    Them,
}

impl Sender {
    /// Resolve authorship by comparing normalized ids.
    #[must_use]
    pub fn resolve(sender: UserId, me: UserId) -> Self {
        if sender == me { Self::Me } else { Self::Them }
    }
}

/// A message as held in the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned id.
    pub id: MessageId,
    /// Authorship relative to the authenticated user.
    pub sender: Sender,
    /// Raw author id.
    pub sender_id: UserId,
    /// Text body.
    pub content: String,
    /// Server creation time.
    pub timestamp: DateTime<Utc>,
    /// Delivery state; never moves backwards.
    pub status: MessageStatus,
    /// Whether this arrived as a broadcast.
    pub is_broadcast: bool,
    /// Sent from this client and not yet seen in a server snapshot.
    pending: bool,
}

impl Message {
    /// Build a cache entry from a server message.
    #[must_use]
    pub fn from_raw(raw: RawMessage, me: UserId) -> Self {
        Self {
            id: raw.id,
            sender: Sender::resolve(raw.sender, me),
            sender_id: raw.sender,
            status: raw.status(),
            content: raw.content,
            timestamp: raw.timestamp,
            is_broadcast: raw.is_broadcast,
            pending: false,
        }
    }

    /// Build the local entry for a message this client just sent.
    ///
    /// The id and timestamp come from the server's echo; the entry stays
    /// pending until a snapshot confirms it.
    #[must_use]
    pub fn sent(raw: RawMessage, me: UserId) -> Self {
        Self {
            id: raw.id,
            sender: Sender::Me,
            sender_id: me,
            content: raw.content,
            timestamp: raw.timestamp,
            status: MessageStatus::Sent,
            is_broadcast: false,
            pending: true,
        }
    }

    /// Whether the server has not yet listed this message in a snapshot.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.pending
    }
}

/// Cached conversation with one peer.
#[derive(Debug, Clone)]
pub struct Conversation {
    peer: UserId,
    messages: Vec<Message>,
    last_synced: Option<DateTime<Utc>>,
    /// Ids the server has confirmed as read through our receipt calls.
    acknowledged: HashSet<MessageId>,
    /// Ids with a receipt call in flight.
    marking: HashSet<MessageId>,
}

impl Conversation {
    /// Creates an empty conversation with `peer`.
    #[must_use]
    pub fn new(peer: UserId) -> Self {
        Self {
            peer,
            messages: Vec::new(),
            last_synced: None,
            acknowledged: HashSet::new(),
            marking: HashSet::new(),
        }
    }

    /// The peer this conversation is with.
    #[must_use]
    pub const fn peer(&self) -> UserId {
        self.peer
    }

    /// Messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// When the last snapshot was applied.
    #[must_use]
    pub const fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced
    }

    /// The newest message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Messages from the peer not yet read.
    #[must_use]
    pub fn unread(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.sender == Sender::Them && m.status != MessageStatus::Read)
            .count()
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Replace the cache with a server snapshot.
    ///
    /// - Statuses only advance: a message known locally as `read` stays
    ///   `read` whatever the snapshot says, and so does one whose receipt
    ///   the server acknowledged.
    /// - Pending local sends missing from the snapshot are kept at their
    ///   chronological position; those present are now confirmed.
    pub fn reconcile(&mut self, snapshot: Vec<Message>, now: DateTime<Utc>) {
        let mut incoming = snapshot;
        incoming.sort_by_key(|m| (m.timestamp, m.id));

        for message in &mut incoming {
            if let Some(previous) = self.get(message.id) {
                message.status = previous.status.advance(message.status);
            }
            if self.acknowledged.contains(&message.id) {
                message.status = MessageStatus::Read;
            }
        }

        let confirmed: HashSet<MessageId> = incoming.iter().map(|m| m.id).collect();
        let survivors: Vec<Message> = self
            .messages
            .drain(..)
            .filter(|m| m.pending && !confirmed.contains(&m.id))
            .collect();

        self.messages = incoming;
        for message in survivors {
            self.insert_chronological(message);
        }
        self.acknowledged.retain(|id| confirmed.contains(id));
        self.last_synced = Some(now);
    }

    /// Place a just-sent message.
    ///
    /// If a snapshot already delivered the same id, the existing entry is
    /// kept (it is confirmed) rather than duplicated.
    pub fn insert_sent(&mut self, message: Message) {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
            existing.status = existing.status.advance(message.status);
            return;
        }
        self.insert_chronological(message);
    }

    fn insert_chronological(&mut self, message: Message) {
        let at = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(at, message);
    }

    /// Claim every unread message from the peer that needs a receipt call.
    ///
    /// Claimed ids are not returned again until the call fails
    /// ([`receipt_failed`](Self::receipt_failed)).
    pub fn begin_receipts(&mut self) -> Vec<MessageId> {
        let due: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|m| {
                m.sender == Sender::Them
                    && m.status != MessageStatus::Read
                    && !self.marking.contains(&m.id)
            })
            .map(|m| m.id)
            .collect();
        self.marking.extend(due.iter().copied());
        due
    }

    /// Record a successful receipt: the message is read from now on.
    pub fn acknowledge_read(&mut self, id: MessageId) {
        self.marking.remove(&id);
        self.acknowledged.insert(id);
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.status = MessageStatus::Read;
        }
    }

    /// Forget a failed receipt so the next sync retries it.
    pub fn receipt_failed(&mut self, id: MessageId) {
        self.marking.remove(&id);
    }

    /// Number of receipt calls in flight.
    #[must_use]
    pub fn receipts_in_flight(&self) -> usize {
        self.marking.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: UserId = UserId::new(7);
    const PEER: UserId = UserId::new(5);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn raw(id: u64, sender: UserId, secs: i64, read: bool) -> RawMessage {
        RawMessage {
            id: MessageId::new(id),
            sender,
            receiver: None,
            content: format!("m{id}"),
            timestamp: at(secs),
            read,
            delivered: read,
            is_broadcast: false,
            broadcast_type: None,
        }
    }

    fn snapshot(raws: Vec<RawMessage>) -> Vec<Message> {
        raws.into_iter().map(|r| Message::from_raw(r, ME)).collect()
    }

    fn ids(conv: &Conversation) -> Vec<u64> {
        conv.messages().iter().map(|m| m.id.get()).collect()
    }

    #[test]
    fn sender_is_resolved_against_me() {
        let mine = Message::from_raw(raw(1, UserId::new(7), 0, false), UserId::new(7));
        assert_eq!(mine.sender, Sender::Me);
        let theirs = Message::from_raw(raw(1, UserId::new(7), 0, false), UserId::new(9));
        assert_eq!(theirs.sender, Sender::Them);
    }

    #[test]
    fn snapshot_is_ordered_oldest_first() {
        let mut conv = Conversation::new(PEER);
        conv.reconcile(
            snapshot(vec![raw(3, PEER, 30, false), raw(1, ME, 10, false), raw(2, PEER, 20, false)]),
            at(100),
        );
        assert_eq!(ids(&conv), vec![1, 2, 3]);
        assert_eq!(conv.last_synced(), Some(at(100)));
    }

    #[test]
    fn read_status_never_reverts() {
        let mut conv = Conversation::new(PEER);
        conv.reconcile(snapshot(vec![raw(1, ME, 10, true)]), at(100));
        assert_eq!(conv.get(MessageId::new(1)).unwrap().status, MessageStatus::Read);

        conv.reconcile(snapshot(vec![raw(1, ME, 10, false)]), at(110));
        assert_eq!(conv.get(MessageId::new(1)).unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn pending_send_survives_snapshot_without_it() {
        let mut conv = Conversation::new(PEER);
        conv.reconcile(snapshot(vec![raw(1, PEER, 10, false)]), at(100));
        conv.insert_sent(Message::sent(raw(2, ME, 20, false), ME));

        conv.reconcile(snapshot(vec![raw(1, PEER, 10, false)]), at(110));
        assert_eq!(ids(&conv), vec![1, 2]);
        assert!(conv.get(MessageId::new(2)).unwrap().is_pending());
    }

    #[test]
    fn pending_send_is_confirmed_by_snapshot_containing_it() {
        let mut conv = Conversation::new(PEER);
        conv.insert_sent(Message::sent(raw(2, ME, 20, false), ME));
        conv.reconcile(
            snapshot(vec![raw(1, PEER, 10, false), raw(2, ME, 20, false)]),
            at(110),
        );
        assert_eq!(ids(&conv), vec![1, 2]);
        assert!(!conv.get(MessageId::new(2)).unwrap().is_pending());

        // Once confirmed, the server is authoritative again.
        conv.reconcile(snapshot(vec![raw(1, PEER, 10, false)]), at(120));
        assert_eq!(ids(&conv), vec![1]);
    }

    #[test]
    fn sent_message_lands_in_chronological_position() {
        let mut conv = Conversation::new(PEER);
        conv.reconcile(
            snapshot(vec![raw(1, PEER, 10, false), raw(3, PEER, 30, false)]),
            at(100),
        );
        conv.insert_sent(Message::sent(raw(2, ME, 20, false), ME));
        assert_eq!(ids(&conv), vec![1, 2, 3]);
    }

    #[test]
    fn sent_message_already_synced_is_not_duplicated() {
        let mut conv = Conversation::new(PEER);
        conv.reconcile(snapshot(vec![raw(2, ME, 20, true)]), at(100));
        conv.insert_sent(Message::sent(raw(2, ME, 20, false), ME));
        assert_eq!(ids(&conv), vec![2]);
        let entry = conv.get(MessageId::new(2)).unwrap();
        assert_eq!(entry.status, MessageStatus::Read);
        assert!(!entry.is_pending());
    }

    #[test]
    fn receipts_are_claimed_once() {
        let mut conv = Conversation::new(PEER);
        conv.reconcile(
            snapshot(vec![
                raw(1, PEER, 10, false),
                raw(2, PEER, 20, false),
                raw(3, ME, 30, false),
                raw(4, PEER, 40, true),
            ]),
            at(100),
        );
        let due = conv.begin_receipts();
        assert_eq!(due, vec![MessageId::new(1), MessageId::new(2)]);
        assert!(conv.begin_receipts().is_empty());
        assert_eq!(conv.receipts_in_flight(), 2);
    }

    #[test]
    fn acknowledged_receipt_overrides_lagging_snapshot() {
        let mut conv = Conversation::new(PEER);
        conv.reconcile(snapshot(vec![raw(1, PEER, 10, false)]), at(100));
        let due = conv.begin_receipts();
        conv.acknowledge_read(due[0]);
        assert_eq!(conv.unread(), 0);

        conv.reconcile(snapshot(vec![raw(1, PEER, 10, false)]), at(110));
        assert_eq!(conv.get(MessageId::new(1)).unwrap().status, MessageStatus::Read);
        assert!(conv.begin_receipts().is_empty());
    }

    #[test]
    fn failed_receipt_is_retried_on_next_claim() {
        let mut conv = Conversation::new(PEER);
        conv.reconcile(snapshot(vec![raw(1, PEER, 10, false)]), at(100));
        let due = conv.begin_receipts();
        conv.receipt_failed(due[0]);
        assert_eq!(conv.begin_receipts(), vec![MessageId::new(1)]);
    }

    #[test]
    fn unread_counts_only_their_unread_messages() {
        let mut conv = Conversation::new(PEER);
        conv.reconcile(
            snapshot(vec![
                raw(1, PEER, 10, false),
                raw(2, ME, 20, false),
                raw(3, PEER, 30, true),
            ]),
            at(100),
        );
        assert_eq!(conv.unread(), 1);
        assert_eq!(conv.last_message().unwrap().id, MessageId::new(3));
    }
}
