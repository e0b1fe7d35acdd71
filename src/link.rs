//! Link endpoints.
//!
//! A link joins two component ports. Each side is a [`LinkEnd`] with its own
//! id, send latency and delivery target; sending on one end delivers to its
//! pair. Endpoints created from configuration link `i` get ids `2i` and
//! `2i + 1` on every partition, so a wire frame can name the receiving end by
//! id alone. When the pair lives on another partition the link is *cut* and
//! the local end records the remote rank instead of a local pair.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::error::{SimError, SimResult};
use crate::event::Event;
use crate::types::{ComponentId, HandlerId, LinkId, Rank, SimTime, MAX_SIM_TIME};

/// Lifecycle of a link endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Connected in the graph but not yet configured by its component.
    Unconfigured,
    /// Configured with a handler or for polling.
    Configured,
    /// Simulation time is running.
    Running,
}

/// Where arriving events go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Unset,
    Handler(HandlerId),
    /// Queued until the owner calls `recv`.
    Polling,
}

/// One side of a link.
pub struct LinkEnd {
    id: LinkId,
    name: String,
    owner: ComponentId,
    port: String,
    pair: LinkId,
    remote: Option<Rank>,
    latency: SimTime,
    time_base: SimTime,
    delivery: Delivery,
    state: LinkState,
    self_link: bool,
    zero_latency: bool,
    disconnected: bool,
    polling: VecDeque<Event>,
    untimed: VecDeque<Event>,
    sent: u64,
    received: u64,
}

impl LinkEnd {
    /// Creates an unconfigured endpoint.
    pub fn new(id: LinkId, name: impl Into<String>, owner: ComponentId, port: impl Into<String>, pair: LinkId, latency: SimTime) -> Self {
        Self {
            id,
            name: name.into(),
            owner,
            port: port.into(),
            pair,
            remote: None,
            latency,
            time_base: 1,
            delivery: Delivery::Unset,
            state: LinkState::Unconfigured,
            self_link: false,
            zero_latency: false,
            disconnected: false,
            polling: VecDeque::new(),
            untimed: VecDeque::new(),
            sent: 0,
            received: 0,
        }
    }

    /// Marks the pair as living on `rank`.
    pub fn with_remote(mut self, rank: Rank) -> Self {
        self.remote = Some(rank);
        self
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Name of the configuration link.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> ComponentId {
        self.owner
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// The endpoint that receives what this end sends.
    pub fn pair(&self) -> LinkId {
        self.pair
    }

    /// Rank of the pair for a cut link.
    pub fn remote_rank(&self) -> Option<Rank> {
        self.remote
    }

    pub fn is_cut(&self) -> bool {
        self.remote.is_some()
    }

    pub fn is_self_link(&self) -> bool {
        self.self_link
    }

    /// Send latency in core ticks.
    pub fn latency(&self) -> SimTime {
        self.latency
    }

    /// Core ticks per unit of extra latency.
    pub fn time_base(&self) -> SimTime {
        self.time_base
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Events sent from this end.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Events delivered to this end.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Events waiting in the polling queue.
    pub fn pending(&self) -> usize {
        self.polling.len()
    }
}

impl fmt::Debug for LinkEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEnd")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("port", &self.port)
            .field("pair", &self.pair)
            .field("remote", &self.remote)
            .field("latency", &self.latency)
            .field("state", &self.state)
            .finish()
    }
}

/// Result of validating a timed send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendPlan {
    pub delivery_time: SimTime,
    pub target: LinkId,
    pub remote: Option<Rank>,
}

/// All link endpoints of one partition.
#[derive(Default, Debug)]
pub struct LinkTable {
    ends: BTreeMap<LinkId, LinkEnd>,
    next_self_id: u32,
}

impl LinkTable {
    /// Creates a table whose self links are numbered from `first_self_id`.
    pub fn new(first_self_id: u32) -> Self {
        Self {
            ends: BTreeMap::new(),
            next_self_id: first_self_id,
        }
    }

    pub fn insert(&mut self, end: LinkEnd) {
        self.ends.insert(end.id, end);
    }

    pub fn get(&self, id: LinkId) -> Option<&LinkEnd> {
        self.ends.get(&id)
    }

    #[track_caller]
    fn end_mut(&mut self, id: LinkId) -> SimResult<&mut LinkEnd> {
        self.ends
            .get_mut(&id)
            .ok_or_else(|| SimError::configuration(format!("{} does not exist on this rank", id)))
    }

    #[track_caller]
    fn end(&self, id: LinkId) -> SimResult<&LinkEnd> {
        self.ends
            .get(&id)
            .ok_or_else(|| SimError::configuration(format!("{} does not exist on this rank", id)))
    }

    pub fn len(&self) -> usize {
        self.ends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinkEnd> + '_ {
        self.ends.values()
    }

    /// Creates a self link owned by `owner`: a pair of endpoints where
    /// sending on the returned end delivers back to it.
    pub fn add_self_link(&mut self, owner: ComponentId, name: &str, latency: SimTime, zero_latency: bool) -> LinkId {
        let id = LinkId(self.next_self_id);
        self.next_self_id += 1;
        let mut end = LinkEnd::new(id, name, owner, name, id, latency);
        end.self_link = true;
        end.zero_latency = zero_latency;
        self.insert(end);
        id
    }

    /// Sets where arriving events go and the unit of extra latency.
    pub fn configure(&mut self, id: LinkId, delivery: Delivery, time_base: SimTime) -> SimResult<()> {
        let end = self.end_mut(id)?;
        if end.state != LinkState::Unconfigured {
            return Err(SimError::configuration(format!(
                "port '{}' ({}) configured twice",
                end.port, id
            )));
        }
        end.delivery = delivery;
        end.time_base = time_base.max(1);
        end.state = LinkState::Configured;
        Ok(())
    }

    /// Adds latency to the send side of an endpoint.
    pub fn add_send_latency(&mut self, id: LinkId, extra: SimTime) -> SimResult<()> {
        let end = self.end_mut(id)?;
        end.latency = end
            .latency
            .checked_add(extra)
            .ok_or_else(|| SimError::temporal(format!("latency overflow on {}", id)))?;
        Ok(())
    }

    /// State of the link as a whole: unconfigured until both local ends are.
    pub fn link_state(&self, id: LinkId) -> Option<LinkState> {
        let end = self.ends.get(&id)?;
        if end.remote.is_none() && end.pair != id {
            if let Some(pair) = self.ends.get(&end.pair) {
                if pair.state == LinkState::Unconfigured {
                    return Some(LinkState::Unconfigured);
                }
            }
        }
        Some(end.state)
    }

    /// Moves every configured endpoint to `Running`. Returns the endpoints
    /// that were never configured.
    pub fn start_running(&mut self) -> Vec<LinkId> {
        let mut unconfigured = Vec::new();
        for end in self.ends.values_mut() {
            match end.state {
                LinkState::Configured => end.state = LinkState::Running,
                LinkState::Unconfigured => unconfigured.push(end.id),
                LinkState::Running => {}
            }
        }
        unconfigured
    }

    /// Validates a timed send of an event on `id` at `now`.
    ///
    /// `extra` is in units of the endpoint's time base.
    #[track_caller]
    pub fn plan_send(&mut self, id: LinkId, now: SimTime, extra: SimTime) -> SimResult<SendPlan> {
        let end = self.end(id)?;
        if end.disconnected {
            return Err(SimError::configuration(format!("send on disconnected port '{}'", end.port)));
        }
        if end.state == LinkState::Unconfigured {
            return Err(SimError::configuration(format!(
                "send on port '{}' before it was configured",
                end.port
            )));
        }
        let extra_ticks = extra
            .checked_mul(end.time_base)
            .ok_or_else(|| SimError::temporal(format!("extra latency overflow on port '{}'", end.port)))?;
        let dt = end
            .latency
            .checked_add(extra_ticks)
            .ok_or_else(|| SimError::temporal(format!("latency overflow on port '{}'", end.port)))?;
        if dt == 0 && !(end.self_link && end.zero_latency) {
            return Err(SimError::temporal(format!(
                "zero effective latency on port '{}' ({})",
                end.port, id
            )));
        }
        let delivery_time = now
            .checked_add(dt)
            .filter(|t| *t <= MAX_SIM_TIME)
            .ok_or_else(|| {
                SimError::temporal(format!(
                    "delivery time on port '{}' exceeds the maximum simulation time",
                    end.port
                ))
            })?;
        let plan = SendPlan {
            delivery_time,
            target: end.pair,
            remote: end.remote,
        };
        self.end_mut(id)?.sent += 1;
        Ok(plan)
    }

    /// Looks up the delivery target of an arriving event and counts it.
    pub(crate) fn arrive(&mut self, id: LinkId) -> SimResult<Delivery> {
        let end = self.end_mut(id)?;
        if end.disconnected {
            return Ok(Delivery::Unset);
        }
        end.received += 1;
        Ok(end.delivery)
    }

    pub(crate) fn push_polling(&mut self, id: LinkId, event: Event) -> SimResult<()> {
        self.end_mut(id)?.polling.push_back(event);
        Ok(())
    }

    /// Pops the oldest event from a polling endpoint.
    pub fn pop_polling(&mut self, id: LinkId) -> SimResult<Option<Event>> {
        Ok(self.end_mut(id)?.polling.pop_front())
    }

    /// Stores an untimed message for the receiving end.
    pub(crate) fn push_untimed(&mut self, id: LinkId, event: Event) -> SimResult<()> {
        self.end_mut(id)?.untimed.push_back(event);
        Ok(())
    }

    /// Pops the oldest untimed message delivered to `id`.
    pub fn pop_untimed(&mut self, id: LinkId) -> SimResult<Option<Event>> {
        Ok(self.end_mut(id)?.untimed.pop_front())
    }

    /// Drops untimed messages nobody read. Returns how many were dropped.
    pub(crate) fn clear_untimed(&mut self) -> usize {
        self.ends
            .values_mut()
            .map(|end| {
                let n = end.untimed.len();
                end.untimed.clear();
                n
            })
            .sum()
    }

    /// Disconnects an endpoint and its local pair. Returns the endpoint ids
    /// whose in-flight events must be dropped.
    pub(crate) fn disconnect(&mut self, id: LinkId) -> SimResult<Vec<LinkId>> {
        let end = self.end_mut(id)?;
        end.disconnected = true;
        end.polling.clear();
        end.untimed.clear();
        let pair = end.pair;
        let mut ids = vec![id];
        if pair != id {
            if let Some(other) = self.ends.get_mut(&pair) {
                other.disconnected = true;
                other.polling.clear();
                other.untimed.clear();
            }
            ids.push(pair);
        }
        Ok(ids)
    }
}
