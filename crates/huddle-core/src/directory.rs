use std::sync::Arc;

use crate::errors::HuddleError;
use crate::events::LeaveReason;
use crate::expectation::SessionExpectation;
use crate::fanout::Fanout;
use crate::listeners::{ListenerRegistry, ListenerToken};
use crate::participant::{Participant, ParticipantHandle};

/// Owns the participant records of one session.
///
/// Reconciles the expected identity list against transport joins and
/// leaves. Every operation that changes the expected list takes the
/// session's [`SessionExpectation`] explicitly. Not synchronized: the
/// session calls it while holding its state lock.
pub struct ParticipantDirectory {
    fanout: Fanout,
    local: Option<Arc<Participant>>,
    remotes: Vec<Arc<Participant>>,
    new_participant: ListenerRegistry<Arc<Participant>>,
}

impl ParticipantDirectory {
    pub fn new(fanout: Fanout) -> Self {
        Self {
            new_participant: ListenerRegistry::new(fanout.clone()),
            fanout,
            local: None,
            remotes: Vec::new(),
        }
    }

    /// Create a pending record for every expected identity except the
    /// login identity. Identities that already have a record are skipped.
    pub fn initialize_pending(&mut self, expectation: &SessionExpectation) -> usize {
        let mut created = 0;
        for identity in &expectation.identities {
            if *identity == expectation.login_identity || self.remote(identity).is_some() {
                continue;
            }
            tracing::debug!("pending participant {identity}");
            self.remotes
                .push(Arc::new(Participant::new(identity.clone(), &self.fanout)));
            created += 1;
        }
        created
    }

    /// Bind a transport participant to its record, creating the record for
    /// an unexpected join.
    ///
    /// A newly created remote record is appended to the expected list and
    /// announced to new-participant listeners.
    pub fn bind_transport_participant(
        &mut self,
        expectation: &mut SessionExpectation,
        identity: &str,
        handle: ParticipantHandle,
        is_local: bool,
    ) -> Arc<Participant> {
        if is_local {
            return self.bind_local(identity, handle);
        }

        if let Some(existing) = self.remote(identity) {
            tracing::debug!("binding expected participant {identity}");
            existing.bind_remote(handle);
            return existing;
        }

        tracing::info!("unexpected participant joined: {identity}");
        let participant = Arc::new(Participant::new(identity, &self.fanout));
        participant.bind_remote(handle);
        self.remotes.push(participant.clone());
        expectation.add_identity(identity);
        self.new_participant.notify(participant.clone());
        participant
    }

    fn bind_local(&mut self, identity: &str, handle: ParticipantHandle) -> Arc<Participant> {
        match &self.local {
            Some(local) if local.identity() == identity && !local.is_disposed() => {
                local.bind_local(handle);
                local.clone()
            }
            _ => {
                if let Some(stale) = self.local.take() {
                    stale.dispose();
                }
                let local = Arc::new(Participant::new(identity, &self.fanout));
                local.bind_local(handle);
                self.local = Some(local.clone());
                local
            }
        }
    }

    /// A remote participant left the room.
    pub fn mark_left(&mut self, expectation: &mut SessionExpectation, identity: &str) -> bool {
        expectation.remove_identity(identity);
        match self.take_remote(identity) {
            Some(participant) => {
                participant.notify_leave(LeaveReason::Left);
                true
            }
            None => {
                tracing::debug!("leave for unknown participant {identity}");
                false
            }
        }
    }

    /// The local transport connection went away.
    pub fn mark_local_left(&mut self, reason: LeaveReason) {
        if let Some(local) = self.local.take() {
            local.notify_leave(reason);
        }
    }

    /// Evict records that never joined.
    ///
    /// Joined records listed in `identities` are left untouched, so a join
    /// that lands before the sweep always wins. Returns the evicted identities.
    pub fn evict_timed_out(
        &mut self,
        expectation: &mut SessionExpectation,
        identities: &[String],
    ) -> Vec<String> {
        let mut evicted = Vec::new();
        for identity in identities {
            let Some(participant) = self.remote(identity) else {
                tracing::debug!("timeout for unknown participant {identity}, skipping");
                continue;
            };
            if participant.is_joined() {
                tracing::debug!("participant {identity} already joined, not evicting");
                continue;
            }
            participant.mark_timed_out(true);
            participant.notify_leave(LeaveReason::Timeout);
            self.take_remote(identity);
            expectation.remove_identity(identity);
            evicted.push(identity.clone());
        }
        if !evicted.is_empty() {
            tracing::info!("evicted {} participants that never joined: {evicted:?}", evicted.len());
        }
        evicted
    }

    /// Add pending records for invited identities.
    ///
    /// Identities that already have a record, the login identity and
    /// repeats are dropped. With no free slot the whole call fails; a batch
    /// larger than the free slots is cut to the first entries that fit.
    pub fn invite(
        &mut self,
        expectation: &mut SessionExpectation,
        identities: &[String],
    ) -> Result<Vec<Arc<Participant>>, HuddleError> {
        let mut batch: Vec<&String> = Vec::new();
        for identity in identities {
            if *identity == expectation.login_identity
                || self.remote(identity).is_some()
                || batch.contains(&identity)
            {
                continue;
            }
            batch.push(identity);
        }
        if batch.is_empty() {
            tracing::debug!("invited participants already present");
            return Ok(Vec::new());
        }

        let available = expectation
            .max_participants
            .saturating_sub(expectation.identities.len());
        if available == 0 {
            tracing::error!(
                "room {} is full ({} participants)",
                expectation.room_name,
                expectation.max_participants
            );
            return Err(HuddleError::CapacityExceeded {
                max: expectation.max_participants,
            });
        }
        if batch.len() > available {
            tracing::warn!(
                "invited {} participants but only {available} slots left, truncating",
                batch.len()
            );
            batch.truncate(available);
        }

        let mut created = Vec::with_capacity(batch.len());
        for identity in batch {
            tracing::debug!("invited participant {identity}");
            let participant = Arc::new(Participant::new(identity.clone(), &self.fanout));
            self.remotes.push(participant.clone());
            expectation.add_identity(identity);
            self.new_participant.notify(participant.clone());
            created.push(participant);
        }
        Ok(created)
    }

    /// Local record first, then remotes in the order they were added.
    pub fn all_participants(&self, include_timed_out: bool) -> Vec<Arc<Participant>> {
        let mut list: Vec<Arc<Participant>> = self.local.iter().cloned().collect();
        list.extend(self.remote_participants(include_timed_out));
        list
    }

    pub fn remote_participants(&self, include_timed_out: bool) -> Vec<Arc<Participant>> {
        let local_identity = self.local.as_ref().map(|p| p.identity());
        self.remotes
            .iter()
            .filter(|p| Some(p.identity()) != local_identity)
            .filter(|p| include_timed_out || !p.is_timed_out())
            .cloned()
            .collect()
    }

    pub fn local_participant(&self) -> Option<Arc<Participant>> {
        self.local.clone()
    }

    pub fn participant(&self, identity: &str) -> Option<Arc<Participant>> {
        match &self.local {
            Some(local) if local.identity() == identity => Some(local.clone()),
            _ => self.remote(identity),
        }
    }

    /// Remote records that are neither joined nor timed out.
    pub fn pending_participants(&self) -> Vec<Arc<Participant>> {
        self.remotes
            .iter()
            .filter(|p| p.is_pending())
            .cloned()
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.remotes.iter().any(|p| p.is_pending())
    }

    pub fn len(&self) -> usize {
        self.remotes.len() + usize::from(self.local.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_new_participant_listener(
        &self,
        listener: impl Fn(Arc<Participant>) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.new_participant
            .subscribe(move |participant| listener(participant.clone()))
    }

    /// Dispose every record.
    pub fn clear(&mut self) {
        tracing::debug!(
            "clearing participants: local {}, remote {}",
            usize::from(self.local.is_some()),
            self.remotes.len()
        );
        if let Some(local) = self.local.take() {
            local.dispose();
        }
        for participant in self.remotes.drain(..) {
            participant.dispose();
        }
    }

    fn remote(&self, identity: &str) -> Option<Arc<Participant>> {
        self.remotes
            .iter()
            .find(|p| p.identity() == identity)
            .cloned()
    }

    fn take_remote(&mut self, identity: &str) -> Option<Arc<Participant>> {
        let pos = self.remotes.iter().position(|p| p.identity() == identity)?;
        Some(self.remotes.remove(pos))
    }
}
