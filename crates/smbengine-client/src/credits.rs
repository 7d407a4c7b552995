//! Credit accounting and message-id allocation.
//!
//! Ids are reserved when a request is submitted; credits are debited when
//! the request is written to the wire and replenished by every response.

use std::collections::BTreeSet;

use smbengine_codec::{Body, UNSOLICITED_MESSAGE_ID};

/// Bytes covered by one credit for bulk transfers.
pub const CREDIT_UNIT: usize = 65536;

/// Credit charge for a body: `ceil(len / 65536)` for reads and writes, 1 otherwise.
pub fn credit_charge(body: &Body, large_mtu: bool) -> u16 {
    let len = match body {
        Body::ReadRequest(read) => read.length as usize,
        Body::WriteRequest(write) => write.data.len(),
        _ => return 1,
    };
    if !large_mtu {
        return 1;
    }
    let units = len.div_ceil(CREDIT_UNIT).max(1);
    u16::try_from(units).unwrap_or(u16::MAX)
}

/// Allocates contiguous message-id runs, skipping blacklisted ids.
#[derive(Debug, Clone)]
pub struct MessageIds {
    next: u64,
    blacklist: BTreeSet<u64>,
}

impl Default for MessageIds {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIds {
    /// Allocation starting at id 0, with the unsolicited id blacklisted.
    pub fn new() -> Self {
        let mut blacklist = BTreeSet::new();
        blacklist.insert(UNSOLICITED_MESSAGE_ID);
        Self { next: 0, blacklist }
    }

    /// The id the next reservation starts searching from.
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Keeps `id` out of every future reservation.
    pub fn blacklist(&mut self, id: u64) {
        self.blacklist.insert(id);
    }

    /// Returns every id from `to` onward to the pool. Only valid when no id
    /// reserved at or after `to` has been used.
    pub fn rewind(&mut self, to: u64) {
        self.next = self.next.min(to);
    }

    /// Reserves `count` consecutive ids and returns the first one.
    ///
    /// The run starts at the counter, moved forward past any blacklisted id
    /// that would fall inside it; the counter then advances past the run.
    pub fn reserve(&mut self, count: u16) -> u64 {
        let count = u64::from(count.max(1));
        let mut start = self.next;
        while let Some(&hit) = self.blacklist.range(start..start.saturating_add(count)).next() {
            start = hit.saturating_add(1);
        }
        self.next = start.saturating_add(count);
        start
    }
}

/// The connection's credit balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditWindow {
    available: u32,
    sent: u64,
    granted: u64,
}

impl CreditWindow {
    /// A window holding `initial` credits.
    pub fn new(initial: u32) -> Self {
        Self {
            available: initial,
            sent: 0,
            granted: 0,
        }
    }

    /// Credits that can still be spent.
    pub fn available(&self) -> u32 {
        self.available
    }

    /// Total charge placed on the wire so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Total credits granted back so far.
    pub fn granted(&self) -> u64 {
        self.granted
    }

    /// Whether a request charging `charge` may be sent now. With nothing
    /// outstanding the server cannot grant more, so the send is let through.
    pub fn admits(&self, charge: u16, outstanding: usize) -> bool {
        self.available >= u32::from(charge) || outstanding == 0
    }

    /// Debits `charge` at send time; never goes below zero.
    pub fn debit(&mut self, charge: u16) {
        self.available = self.available.saturating_sub(u32::from(charge));
        self.sent += u64::from(charge);
    }

    /// Adds credits granted by a response.
    pub fn grant(&mut self, credits: u16) {
        self.available = self.available.saturating_add(u32::from(credits));
        self.granted += u64::from(credits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smbengine_codec::{FileId, ReadRequest, WriteRequest};

    #[test]
    fn test_charge_rounds_up_per_64k() {
        let read = |length| {
            Body::ReadRequest(ReadRequest {
                length,
                offset: 0,
                file_id: FileId::default(),
                minimum_count: 0,
            })
        };
        assert_eq!(credit_charge(&read(0), true), 1);
        assert_eq!(credit_charge(&read(65536), true), 1);
        assert_eq!(credit_charge(&read(65537), true), 2);
        assert_eq!(credit_charge(&read(1 << 20), true), 16);
        assert_eq!(credit_charge(&read(1 << 20), false), 1);
        let write = Body::WriteRequest(WriteRequest {
            offset: 0,
            file_id: FileId::default(),
            flags: 0,
            data: vec![0; 200_000],
        });
        assert_eq!(credit_charge(&write, true), 4);
        assert_eq!(credit_charge(&Body::EchoRequest, true), 1);
    }

    #[test]
    fn test_reserve_skips_blacklisted_run() {
        let mut ids = MessageIds::new();
        ids.blacklist(3);
        assert_eq!(ids.reserve(2), 0);
        assert_eq!(ids.reserve(2), 4);
        assert_eq!(ids.next(), 6);
        ids.blacklist(7);
        assert_eq!(ids.reserve(1), 6);
        assert_eq!(ids.reserve(1), 8);
    }

    #[test]
    fn test_rewind_hands_back_an_unused_run() {
        let mut ids = MessageIds::new();
        assert_eq!(ids.reserve(3), 0);
        let mark = ids.next();
        assert_eq!(ids.reserve(4), 3);
        ids.rewind(mark);
        assert_eq!(ids.reserve(1), 3);
        ids.rewind(10);
        assert_eq!(ids.next(), 4);
    }

    #[test]
    fn test_window_saturates_and_admits_when_idle() {
        let mut window = CreditWindow::new(1);
        assert!(window.admits(1, 0));
        window.debit(1);
        assert!(!window.admits(1, 1));
        assert!(window.admits(4, 0));
        window.debit(4);
        assert_eq!(window.available(), 0);
        window.grant(10);
        assert_eq!(window.available(), 10);
        assert_eq!(window.sent(), 5);
        assert_eq!(window.granted(), 10);
    }
}
