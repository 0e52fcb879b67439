//! IPv4 fragment reassembly with strict overlap rejection.
//!
//! Flows are keyed by (src, dst, identification) in a CTable that never
//! grows: when it is full, a uniformly random existing flow is ejected
//! to make room. Any structural anomaly — overlap, gap at completion,
//! too many fragments, duplicate final fragment, oversize — drops the
//! whole flow; the policy is RFC 5722's: reassemble exactly or not at
//! all.

use crate::ctable::{AddMode, CTable, CTableParams, Record};
use crate::packet::{MAX_PAYLOAD, Packet, PacketPool};
use crate::wire::{ETHERTYPE_IPV4, Ipv4View, Ipv4ViewMut, l3_offset};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Compile-time bound on fragments per flow; the runtime
/// `max_frags_per_packet` limit must be at or below it.
pub const MAX_FRAGMENTS_CEILING: usize = 40;

/// Fragment-table key: one entry per in-flight datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentKey {
    pub src: u32,
    pub dst: u32,
    pub id: u16,
}

impl Record for FragmentKey {
    const SIZE: usize = 10;
    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.src.to_le_bytes());
        buf[4..8].copy_from_slice(&self.dst.to_le_bytes());
        buf[8..10].copy_from_slice(&self.id.to_le_bytes());
    }
    fn read_from(buf: &[u8]) -> Self {
        Self {
            src: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            dst: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            id: u16::from_le_bytes([buf[8], buf[9]]),
        }
    }
}

/// Per-flow reassembly state. Fragment ranges are kept sorted by start
/// offset (insertion sort on arrival); payload bytes land directly at
/// their final position in `packet_data`.
#[derive(Clone, Copy)]
struct ReassemblyBuffer {
    fragment_starts: [u16; MAX_FRAGMENTS_CEILING],
    fragment_ends: [u16; MAX_FRAGMENTS_CEILING],
    fragment_count: u16,
    /// Start offset of the MF=0 fragment; 0 means "not yet received"
    /// (a final fragment at offset zero is not a fragment at all).
    final_start: u16,
    /// L2+L3 header bytes to skip when copying payloads.
    reassembly_base: u16,
    /// Payload bytes accumulated so far.
    running_length: u32,
    /// Maximum `base + frag_start + frag_size` seen.
    reassembly_length: u32,
    packet_data: [u8; MAX_PAYLOAD],
}

impl ReassemblyBuffer {
    fn empty() -> Self {
        Self {
            fragment_starts: [0; MAX_FRAGMENTS_CEILING],
            fragment_ends: [0; MAX_FRAGMENTS_CEILING],
            fragment_count: 0,
            final_start: 0,
            reassembly_base: 0,
            running_length: 0,
            reassembly_length: 0,
            packet_data: [0; MAX_PAYLOAD],
        }
    }
}

impl Record for ReassemblyBuffer {
    const SIZE: usize = MAX_FRAGMENTS_CEILING * 4 + 14 + MAX_PAYLOAD;
    fn write_to(&self, buf: &mut [u8]) {
        let mut at = 0;
        for s in &self.fragment_starts {
            buf[at..at + 2].copy_from_slice(&s.to_le_bytes());
            at += 2;
        }
        for e in &self.fragment_ends {
            buf[at..at + 2].copy_from_slice(&e.to_le_bytes());
            at += 2;
        }
        buf[at..at + 2].copy_from_slice(&self.fragment_count.to_le_bytes());
        buf[at + 2..at + 4].copy_from_slice(&self.final_start.to_le_bytes());
        buf[at + 4..at + 6].copy_from_slice(&self.reassembly_base.to_le_bytes());
        buf[at + 6..at + 10].copy_from_slice(&self.running_length.to_le_bytes());
        buf[at + 10..at + 14].copy_from_slice(&self.reassembly_length.to_le_bytes());
        buf[at + 14..].copy_from_slice(&self.packet_data);
    }
    fn read_from(buf: &[u8]) -> Self {
        let mut out = Self::empty();
        let mut at = 0;
        for s in out.fragment_starts.iter_mut() {
            *s = u16::from_le_bytes([buf[at], buf[at + 1]]);
            at += 2;
        }
        for e in out.fragment_ends.iter_mut() {
            *e = u16::from_le_bytes([buf[at], buf[at + 1]]);
            at += 2;
        }
        out.fragment_count = u16::from_le_bytes([buf[at], buf[at + 1]]);
        out.final_start = u16::from_le_bytes([buf[at + 2], buf[at + 3]]);
        out.reassembly_base = u16::from_le_bytes([buf[at + 4], buf[at + 5]]);
        out.running_length = u32::from_le_bytes([buf[at + 6], buf[at + 7], buf[at + 8], buf[at + 9]]);
        out.reassembly_length =
            u32::from_le_bytes([buf[at + 10], buf[at + 11], buf[at + 12], buf[at + 13]]);
        out.packet_data.copy_from_slice(&buf[at + 14..]);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyStatus {
    /// A datagram completed; the reassembled packet is returned.
    Ok,
    /// State retained, waiting for more fragments.
    FragmentMissing,
    /// Structural anomaly; the flow was dropped.
    Invalid,
}

#[derive(Debug, Default, Clone)]
pub struct ReassemblyStats {
    pub reassembled: u64,
    pub invalid: u64,
    pub evicted: u64,
    pub fragments_cached: u64,
}

pub struct Reassembler {
    table: CTable<FragmentKey, ReassemblyBuffer>,
    max_packets: u32,
    max_frags: usize,
    scratch: Box<ReassemblyBuffer>,
    rng: ChaCha20Rng,
    pub stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(max_concurrent_packets: u32, max_frags_per_packet: usize) -> Self {
        assert!(max_concurrent_packets >= 1);
        assert!(
            (1..=MAX_FRAGMENTS_CEILING).contains(&max_frags_per_packet),
            "max_frags_per_packet out of range"
        );
        // Size so that max_concurrent_packets fits below the grow
        // threshold; growth then never fires and the table stays at a
        // fixed footprint. Fullness is handled by random ejection.
        let initial_size = (max_concurrent_packets as f64 / 0.9).ceil() as u32;
        let table = CTable::new(CTableParams {
            initial_size,
            max_occupancy_rate: 0.9,
            ..Default::default()
        });
        Self {
            table,
            max_packets: max_concurrent_packets,
            max_frags: max_frags_per_packet,
            scratch: Box::new(ReassemblyBuffer::empty()),
            rng: ChaCha20Rng::from_entropy(),
            stats: ReassemblyStats::default(),
        }
    }

    pub fn flow_count(&self) -> u32 {
        self.table.occupancy()
    }

    /// Ingest one fragment. Consumes the packet; on `Ok` the caller gets
    /// the reassembled datagram back, on `FragmentMissing` the payload
    /// was cached, on `Invalid` the flow (if any) was dropped.
    pub fn cache_fragment(
        &mut self,
        fragment: Packet,
        pool: &mut PacketPool,
    ) -> (ReassemblyStatus, Option<Packet>) {
        match self.try_cache(&fragment) {
            CacheOutcome::Cached => {
                self.stats.fragments_cached += 1;
                pool.free(fragment);
                (ReassemblyStatus::FragmentMissing, None)
            }
            CacheOutcome::Complete(key) => {
                self.stats.fragments_cached += 1;
                let out = self.emit(&key, pool);
                pool.free(fragment);
                match out {
                    Some(packet) => {
                        self.stats.reassembled += 1;
                        (ReassemblyStatus::Ok, Some(packet))
                    }
                    None => {
                        self.stats.invalid += 1;
                        (ReassemblyStatus::Invalid, None)
                    }
                }
            }
            CacheOutcome::Drop(key) => {
                if let Some(key) = key {
                    let _ = self.table.remove(&key, true);
                }
                self.stats.invalid += 1;
                pool.free(fragment);
                (ReassemblyStatus::Invalid, None)
            }
        }
    }

    fn try_cache(&mut self, fragment: &Packet) -> CacheOutcome {
        let frame = fragment.data();
        let Some((ethertype, l3)) = l3_offset(frame) else {
            return CacheOutcome::Drop(None);
        };
        if ethertype != ETHERTYPE_IPV4 {
            return CacheOutcome::Drop(None);
        }
        let Some(ip) = Ipv4View::new(&frame[l3..]) else {
            return CacheOutcome::Drop(None);
        };
        if !ip.is_fragment() {
            return CacheOutcome::Drop(None);
        }

        let ihl = ip.header_len();
        let base = l3 + ihl;
        let key = FragmentKey { src: ip.src(), dst: ip.dst(), id: ip.identification() };
        let frag_start = ip.fragment_offset() as usize;
        let frag_size = (ip.total_length() as usize).saturating_sub(ihl);
        let more_fragments = ip.more_fragments();

        if frag_size == 0 || frame.len() < base + frag_size {
            tracing::debug!("fragment shorter than its header claims, flow {:?} dropped", key);
            return CacheOutcome::Drop(Some(key));
        }

        if self.table.lookup(&key).is_none() {
            if self.table.occupancy() >= self.max_packets {
                self.eject_random_flow();
            }
            let scratch = &mut *self.scratch;
            scratch.fragment_count = 0;
            scratch.final_start = 0;
            scratch.running_length = 0;
            scratch.reassembly_length = 0;
            scratch.reassembly_base = base as u16;
            scratch.packet_data[..base].copy_from_slice(&frame[..base]);
            self.table
                .add(&key, &*self.scratch, AddMode::Insert)
                .expect("fresh fragment flow insert");
        }

        let buffer = self.table.lookup_mut(&key).expect("fragment flow just ensured");
        let stored_base = buffer.reassembly_base as usize;

        // Oversize: the payload would not fit the output buffer.
        if stored_base + frag_start + frag_size > MAX_PAYLOAD {
            tracing::debug!("oversize reassembly for flow {:?} dropped", key);
            return CacheOutcome::Drop(Some(key));
        }
        if frame.len() < stored_base + frag_size {
            return CacheOutcome::Drop(Some(key));
        }
        if buffer.fragment_count as usize + 1 > self.max_frags {
            tracing::debug!("flow {:?} exceeded max fragments, dropped as malicious", key);
            return CacheOutcome::Drop(Some(key));
        }
        if !more_fragments && buffer.final_start != 0 {
            tracing::debug!("duplicate final fragment for flow {:?}", key);
            return CacheOutcome::Drop(Some(key));
        }

        // Insertion sort of the new (start, end) range.
        let start16 = frag_start as u16;
        let end16 = (frag_start + frag_size) as u16;
        let mut i = buffer.fragment_count as usize;
        while i > 0 && buffer.fragment_starts[i - 1] > start16 {
            buffer.fragment_starts[i] = buffer.fragment_starts[i - 1];
            buffer.fragment_ends[i] = buffer.fragment_ends[i - 1];
            i -= 1;
        }
        buffer.fragment_starts[i] = start16;
        buffer.fragment_ends[i] = end16;
        buffer.fragment_count += 1;

        if !more_fragments {
            buffer.final_start = start16;
        }

        buffer.packet_data[stored_base + frag_start..stored_base + frag_start + frag_size]
            .copy_from_slice(&frame[stored_base..stored_base + frag_size]);
        buffer.running_length += frag_size as u32;
        buffer.reassembly_length =
            buffer.reassembly_length.max((stored_base + frag_start + frag_size) as u32);

        match Self::flow_status(buffer) {
            ReassemblyStatus::FragmentMissing => CacheOutcome::Cached,
            ReassemblyStatus::Ok => CacheOutcome::Complete(key),
            ReassemblyStatus::Invalid => {
                tracing::debug!("flow {:?} rejected: overlap or gap", key);
                CacheOutcome::Drop(Some(key))
            }
        }
    }

    /// Judge the flow after each fragment. Overlap is rejected the
    /// moment it appears; completion requires the final fragment, a
    /// byte count that matches the extent, and perfect tiling from
    /// offset zero.
    fn flow_status(buffer: &ReassemblyBuffer) -> ReassemblyStatus {
        let n = buffer.fragment_count as usize;
        for i in 1..n {
            if buffer.fragment_starts[i] < buffer.fragment_ends[i - 1] {
                return ReassemblyStatus::Invalid;
            }
        }
        let expected = buffer.reassembly_length - buffer.reassembly_base as u32;
        if buffer.final_start == 0 || buffer.running_length != expected {
            return ReassemblyStatus::FragmentMissing;
        }
        if buffer.fragment_starts[0] != 0 {
            return ReassemblyStatus::Invalid;
        }
        for i in 1..n {
            if buffer.fragment_starts[i] != buffer.fragment_ends[i - 1] {
                return ReassemblyStatus::Invalid;
            }
        }
        ReassemblyStatus::Ok
    }

    /// Build the reassembled packet and release the flow. The flow is
    /// removed whether or not emission succeeds.
    fn emit(&mut self, key: &FragmentKey, pool: &mut PacketPool) -> Option<Packet> {
        let total;
        let mut out;
        {
            let buffer = self.table.lookup(key)?;
            total = buffer.reassembly_length as usize;
            out = pool.allocate();
            out.append(&buffer.packet_data[..total]);
        }
        let _ = self.table.remove(key, true);

        let Some((_, l3)) = l3_offset(out.data()) else {
            pool.free(out);
            return None;
        };
        let ip_total = (total - l3) as u16;
        let data = out.data_mut();
        let Some(mut ip) = Ipv4ViewMut::new(&mut data[l3..]) else {
            pool.free(out);
            return None;
        };
        ip.set_total_length(ip_total);
        ip.set_identification(0);
        ip.set_flags_and_fragment_offset(0);
        ip.update_checksum();
        Some(out)
    }

    fn eject_random_flow(&mut self) {
        if let Some(index) = self.table.random_occupied_index(&mut self.rng) {
            let key = self.table.entry_at(index).map(|(k, _)| *k);
            self.table.remove_at(index);
            self.stats.evicted += 1;
            tracing::debug!("fragment table full, ejected flow {:?}", key);
        }
    }

    // TODO: expire flows that never complete. Random ejection is the
    // only bound on stale state today; a tick-driven expiry needs a
    // last-activity stamp in the buffer and a sweep hook like the scan
    // suppressor's.
}

enum CacheOutcome {
    Cached,
    Complete(FragmentKey),
    Drop(Option<FragmentKey>),
}
