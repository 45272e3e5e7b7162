use core::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use crate::source::host::{Clock, HostLink};

/// How the scripted host treats the next transfer the device arms.
#[derive(Clone, Debug)]
pub enum HostReply {
    /// Clock in these bytes and release the select line.
    Respond(Vec<u8>),
    /// Never start the transfer.
    Silent,
}

/// Link to a host following a fixed script, one reply per armed transfer.
pub struct MockHostLink {
    script: VecDeque<HostReply>,
    current: Option<HostReply>,
    received: Vec<u8>,
    /// Incoming length of every armed transfer.
    pub requested: Vec<usize>,
    /// Outgoing bytes of every armed transfer.
    pub sent: Vec<Vec<u8>>,
    pub stopped: usize,
}

impl MockHostLink {
    pub fn new(script: impl IntoIterator<Item = HostReply>) -> Self {
        MockHostLink {
            script: script.into_iter().collect(),
            current: None,
            received: Vec::new(),
            requested: Vec::new(),
            sent: Vec::new(),
            stopped: 0,
        }
    }

    /// Acknowledgement bytes sent to the host so far.
    pub fn acknowledgements(&self) -> Vec<u8> {
        self.requested
            .iter()
            .zip(&self.sent)
            .filter(|(incoming, _)| **incoming == 1)
            .filter_map(|(_, outgoing)| outgoing.first().copied())
            .collect()
    }
}

impl HostLink for MockHostLink {
    fn start_transfer(&mut self, incoming: usize, outgoing: &[u8]) {
        self.requested.push(incoming);
        self.sent.push(outgoing.to_vec());
        self.current = Some(self.script.pop_front().unwrap_or(HostReply::Silent));
    }

    fn is_transfer_complete(&mut self) -> bool {
        match self.current.take() {
            Some(HostReply::Respond(data)) => {
                self.received = data;
                true
            }
            other => {
                self.current = other;
                false
            }
        }
    }

    fn stop_transfer(&mut self) {
        self.current = None;
        self.stopped += 1;
    }

    fn received(&self) -> &[u8] {
        &self.received
    }
}

/// Shared millisecond counter, advancing by `step` on every reading.
#[derive(Clone)]
pub struct MockClock {
    now: Rc<Cell<u32>>,
    step: u32,
}

impl MockClock {
    pub fn new(step: u32) -> Self {
        MockClock {
            now: Rc::new(Cell::new(0)),
            step,
        }
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u32 {
        let now = self.now.get();
        self.now.set(now.wrapping_add(self.step));
        now
    }
}
