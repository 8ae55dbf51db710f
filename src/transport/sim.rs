//! # Simulated Flight Controller
//!
//! Answers parameter requests the way an autopilot does: a list request
//! streams every entry with its index and the table size, reads and writes
//! answer with a single echo. Names are stored as 16-byte wire ids, so long
//! names come back truncated.
//!
//! [`SimFaults`] injects the misbehaviour seen on real radio links.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::channel::DeviceEnd;
use crate::protocol::name::{decode_param_id, encode_param_id};
use crate::protocol::{
    DeviceAddress, Inbound, InboundFrame, Outbound, ParamType, ReadTarget, ValueEcho,
    PARAM_NAME_LEN,
};

/// Fault injection switches
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// Stream list items in this order; indices may repeat
    pub list_order: Option<Vec<u16>>,

    /// Omitted from list bursts but answered when read by index
    pub drop_from_list: HashSet<u16>,

    /// Never answered, whatever the request
    pub unreachable: HashSet<u16>,

    /// Number of upcoming write confirmations to drop
    pub drop_set_echoes: usize,

    /// Keep old values on writes (still echoed)
    pub ignore_writes: bool,

    /// Answer nothing at all
    pub silent: bool,

    /// Delay before each batch of replies
    pub reply_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
struct SimEntry {
    id: [u8; PARAM_NAME_LEN],
    value: f32,
    param_type: ParamType,
}

#[derive(Debug)]
struct SimState {
    table: Vec<SimEntry>,
    faults: SimFaults,
    requests: Vec<Outbound>,
}

/// Builder for a simulated flight controller
#[derive(Debug)]
pub struct SimulatedDevice {
    address: DeviceAddress,
    table: Vec<SimEntry>,
    faults: SimFaults,
}

impl SimulatedDevice {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            table: Vec::new(),
            faults: SimFaults::default(),
        }
    }

    /// Append a parameter; its index is its position
    pub fn with_param(mut self, name: &str, value: f32, param_type: ParamType) -> Self {
        self.table.push(SimEntry {
            id: encode_param_id(name),
            value: param_type.coerce(value),
            param_type,
        });
        self
    }

    pub fn with_faults(mut self, faults: SimFaults) -> Self {
        self.faults = faults;
        self
    }

    /// Start answering requests arriving on `end`
    pub fn spawn(self, end: DeviceEnd) -> SimHandle {
        let state = Arc::new(Mutex::new(SimState {
            table: self.table,
            faults: self.faults,
            requests: Vec::new(),
        }));
        let replies = end.replies.clone();
        let task = tokio::spawn(serve(self.address, Arc::clone(&state), end));

        SimHandle {
            address: self.address,
            state,
            replies,
            task: Arc::new(task),
        }
    }
}

/// Control and inspection handle for a running simulated device
#[derive(Debug, Clone)]
pub struct SimHandle {
    address: DeviceAddress,
    state: Arc<Mutex<SimState>>,
    replies: mpsc::Sender<InboundFrame>,
    task: Arc<JoinHandle<()>>,
}

impl SimHandle {
    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<Outbound> {
        self.state.lock().requests.clone()
    }

    /// Number of received requests matching `predicate`
    pub fn count_requests<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Outbound) -> bool,
    {
        self.state.lock().requests.iter().filter(|r| predicate(r)).count()
    }

    /// Current device-side value of a parameter
    pub fn value(&self, name: &str) -> Option<f32> {
        let id = encode_param_id(name);
        self.state
            .lock()
            .table
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.value)
    }

    /// Change fault injection while running
    pub fn update_faults<F>(&self, f: F)
    where
        F: FnOnce(&mut SimFaults),
    {
        f(&mut self.state.lock().faults);
    }

    /// Emit an unsolicited frame, optionally from another source
    pub async fn emit(&self, source: Option<DeviceAddress>, echo: ValueEcho) {
        let frame = InboundFrame {
            source: source.unwrap_or(self.address),
            message: Inbound::ValueEcho(echo),
        };
        let _ = self.replies.send(frame).await;
    }

    /// Stop answering; the link closes once every handle is dropped
    pub fn stop(&self) {
        self.task.abort();
    }
}

async fn serve(address: DeviceAddress, state: Arc<Mutex<SimState>>, mut end: DeviceEnd) {
    while let Some(frame) = end.requests.recv().await {
        if frame.target.system_id != address.system_id && frame.target.system_id != 0 {
            trace!("Ignoring request for {:?}", frame.target);
            continue;
        }

        let (replies, delay) = {
            let mut state = state.lock();
            state.requests.push(frame.message.clone());
            (answer(&mut state, &frame.message), state.faults.reply_delay)
        };

        if replies.is_empty() {
            continue;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        for echo in replies {
            let reply = InboundFrame {
                source: address,
                message: Inbound::ValueEcho(echo),
            };
            if end.replies.send(reply).await.is_err() {
                debug!("Simulated device link closed");
                return;
            }
        }
    }
}

fn answer(state: &mut SimState, request: &Outbound) -> Vec<ValueEcho> {
    if state.faults.silent {
        return Vec::new();
    }

    let count = state.table.len() as u16;
    match request {
        Outbound::ListRequest => {
            let order = state
                .faults
                .list_order
                .clone()
                .unwrap_or_else(|| (0..count).collect());
            order
                .into_iter()
                .filter(|i| {
                    !state.faults.drop_from_list.contains(i) && !state.faults.unreachable.contains(i)
                })
                .filter_map(|i| echo_at(state, i))
                .collect()
        }
        Outbound::ReadRequest(ReadTarget::Index(index)) => {
            if state.faults.unreachable.contains(index) {
                return Vec::new();
            }
            echo_at(state, *index).into_iter().collect()
        }
        Outbound::ReadRequest(ReadTarget::Name(name)) => match find(state, name) {
            Some(index) if !state.faults.unreachable.contains(&index) => {
                echo_at(state, index).into_iter().collect()
            }
            _ => Vec::new(),
        },
        Outbound::SetRequest { name, value, .. } => {
            let Some(index) = find(state, name) else {
                return Vec::new();
            };
            if state.faults.unreachable.contains(&index) {
                return Vec::new();
            }
            if !state.faults.ignore_writes {
                let entry = &mut state.table[index as usize];
                entry.value = entry.param_type.coerce(*value);
            }
            if state.faults.drop_set_echoes > 0 {
                state.faults.drop_set_echoes -= 1;
                return Vec::new();
            }
            echo_at(state, index).into_iter().collect()
        }
    }
}

fn find(state: &SimState, name: &str) -> Option<u16> {
    let id = encode_param_id(name);
    state
        .table
        .iter()
        .position(|entry| entry.id == id)
        .map(|i| i as u16)
}

fn echo_at(state: &SimState, index: u16) -> Option<ValueEcho> {
    let entry = state.table.get(index as usize)?;
    Some(ValueEcho::new(
        &decode_param_id(&entry.id),
        entry.value,
        entry.param_type,
        index,
        state.table.len() as u16,
    ))
}
