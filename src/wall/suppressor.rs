// Stonewall Scan Suppressor — TRW-style containment
// Copyright (c) 2024-2026 Stonewall developers
// Distributed under the MIT software license.

//! The scan-suppression app.
//!
//! Two approximate caches drive the policy: the connection cache
//! remembers which direction(s) of a flow bucket have been seen, and
//! the address cache keeps a per-external-address count of likely
//! connection misses. An outside host whose count reaches the block
//! threshold gets its new-flow packets dropped; flows an inside host
//! initiated keep working.
//!
//! # What this does NOT protect against
//!
//! - Slow scans below the decay rate — counts decay by one per
//!   `d_miss_ticks`, so a scanner probing slower than that never
//!   accumulates.
//! - Scans from many source addresses: the count is per-address by
//!   design.

use crate::ctable::fresh_seed;
use crate::link::Link;
use crate::packet::{Packet, PacketPool};
use crate::wall::addr_cache::{AddrCache, DEFAULT_ADDR_LINES};
use crate::wall::classify::{Classifier, Ipv4Prefix, Verdict, is_block_sensitive, is_hygiene};
use crate::wall::conn_cache::{ConnCache, DEFAULT_CONN_SLOTS};
use rand_chacha::ChaCha20Rng;
use rand::{RngCore, SeedableRng};
use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
pub struct WallConfig {
    /// The trusted network; traffic crossing its boundary is policed.
    pub inside_network: Ipv4Prefix,
    /// Block once an address's miss count reaches this (strictly-below
    /// comparison: a count of T-1 still forwards).
    pub block_threshold: i16,
    /// Lower count clamp. -5 gives a well-behaved host that much credit
    /// before misses start counting against it.
    pub c_min: i16,
    /// Upper count clamp; `i16::MAX` means unbounded.
    pub c_max: i16,
    /// Miss-count decay period in ticks.
    pub d_miss_ticks: u64,
    /// Connection aging period in ticks.
    pub age_interval_ticks: u64,
    /// Age (in aging periods) after which an idle connection bucket is
    /// cleared. Must fit the 6-bit age field.
    pub d_conn_ticks: u8,
    pub conn_slots: usize,
    pub addr_lines: usize,
    /// Cache seed override; `None` draws fresh seeds (deterministic
    /// under `RANDOM_SEED`).
    pub seed: Option<[u8; 16]>,
}

impl WallConfig {
    pub fn new(inside_network: Ipv4Prefix) -> Self {
        Self {
            inside_network,
            block_threshold: 5,
            c_min: -5,
            c_max: i16::MAX,
            d_miss_ticks: 1,
            age_interval_ticks: 16,
            d_conn_ticks: 4,
            conn_slots: DEFAULT_CONN_SLOTS,
            addr_lines: DEFAULT_ADDR_LINES,
            seed: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct WallStats {
    pub forwarded: u64,
    /// Dropped because the source was at or over the block threshold.
    pub dropped_blocked: u64,
    /// Dropped by the hygiene filter (unsolicited RST/FIN/SYN+ACK).
    pub dropped_hygiene: u64,
}

enum Decision {
    Forward,
    DropBlocked,
    DropHygiene,
}

pub struct ScanSuppressor {
    classifier: Classifier,
    conn: ConnCache,
    addr: AddrCache,
    block_threshold: i16,
    d_miss_ticks: u64,
    age_interval_ticks: u64,
    d_conn_ticks: u8,
    miss_timer: u64,
    age_timer: u64,
    pub stats: WallStats,
}

impl ScanSuppressor {
    pub fn new(config: WallConfig) -> Self {
        assert!(config.d_conn_ticks >= 1 && config.d_conn_ticks <= 63);
        assert!(config.d_miss_ticks >= 1);
        assert!(config.age_interval_ticks >= 1);

        // One configured seed fans out to per-cache seeds, so the two
        // caches never share bucket placement.
        let base = config.seed.unwrap_or_else(fresh_seed);
        let mut expanded = [0u8; 32];
        expanded[..16].copy_from_slice(&base);
        expanded[16..].copy_from_slice(&base);
        let mut rng = ChaCha20Rng::from_seed(expanded);
        let mut conn_seed = [0u8; 16];
        let mut addr_seed = [0u8; 16];
        rng.fill_bytes(&mut conn_seed);
        rng.fill_bytes(&mut addr_seed);

        tracing::info!(
            "scan suppressor up: inside {}, threshold {}, {} conn slots, {} addr lines",
            config.inside_network,
            config.block_threshold,
            config.conn_slots,
            config.addr_lines
        );

        Self {
            classifier: Classifier::new(config.inside_network),
            conn: ConnCache::new(config.conn_slots, conn_seed),
            addr: AddrCache::new(config.addr_lines, addr_seed, config.c_min, config.c_max),
            block_threshold: config.block_threshold,
            d_miss_ticks: config.d_miss_ticks,
            age_interval_ticks: config.age_interval_ticks,
            d_conn_ticks: config.d_conn_ticks,
            miss_timer: 0,
            age_timer: 0,
            stats: WallStats::default(),
        }
    }

    /// Current miss count for an external address.
    pub fn address_count(&self, addr: u32) -> i16 {
        self.addr.count(addr)
    }

    /// One breath: run due housekeeping, then drain the input link until
    /// it is empty or the output link is full. Sweeps never run
    /// mid-packet, and packet order is preserved.
    pub fn push(&mut self, input: &mut Link, output: &mut Link, pool: &mut PacketPool, now: u64) {
        if now >= self.miss_timer {
            self.addr.decay_sweep();
            self.miss_timer = now + self.d_miss_ticks;
        }
        if now >= self.age_timer {
            self.conn.age_sweep(self.d_conn_ticks);
            self.age_timer = now + self.age_interval_ticks;
        }

        while !input.is_empty() && !output.is_full() {
            let Some(packet) = input.receive() else { break };
            match self.process(&packet) {
                Decision::Forward => {
                    self.stats.forwarded += 1;
                    output.transmit(packet);
                }
                Decision::DropBlocked => {
                    self.stats.dropped_blocked += 1;
                    pool.free(packet);
                }
                Decision::DropHygiene => {
                    self.stats.dropped_hygiene += 1;
                    pool.free(packet);
                }
            }
        }
    }

    fn process(&mut self, packet: &Packet) -> Decision {
        let frame = packet.data();
        match self.classifier.classify(frame) {
            Verdict::Forward => Decision::Forward,
            Verdict::Inside { inside, outside, port } => {
                self.handle_inside(inside, outside, port);
                Decision::Forward
            }
            Verdict::Outside { inside, outside, port } => {
                self.handle_outside(frame, inside, outside, port)
            }
        }
    }

    /// Trusted-source packet: always forwarded. The first egress packet
    /// of a bucket the outside reached first turns a counted miss into a
    /// hit, refunding it twice (the +1 it cost, and -1 of credit).
    fn handle_inside(&mut self, inside: u32, outside: u32, port: u16) {
        let index = self.conn.index(inside, outside, port);
        let entry = self.conn.entry(index);
        if !entry.in_to_out && entry.out_to_in {
            let count = self.addr.count(outside);
            self.addr.set_count(outside, count - 2);
        }
        self.conn.store(index, true, entry.out_to_in);
    }

    fn handle_outside(&mut self, frame: &[u8], inside: u32, outside: u32, port: u16) -> Decision {
        let count = self.addr.count(outside);
        let index = self.conn.index(inside, outside, port);
        let entry = self.conn.entry(index);

        if count < self.block_threshold {
            if !entry.out_to_in {
                if entry.in_to_out {
                    // Response to an inside-initiated flow: a hit.
                    self.addr.set_count(outside, count - 1);
                } else if is_hygiene(frame) {
                    // Cannot open a flow; never counts, never passes.
                    return Decision::DropHygiene;
                } else {
                    // First sighting from outside: a potential miss.
                    self.addr.set_count(outside, count + 1);
                }
            }
            self.conn.store(index, entry.in_to_out, true);
            Decision::Forward
        } else if entry.in_to_out {
            // Blocked source, but the inside initiated this bucket.
            if is_block_sensitive(frame) {
                tracing::debug!(
                    "blocked {} probing established bucket with new-flow packet",
                    Ipv4Addr::from(outside)
                );
                return Decision::DropBlocked;
            }
            if !entry.out_to_in {
                // The reply rescues the connection retroactively.
                self.addr.set_count(outside, count - 1);
            }
            self.conn.store(index, true, true);
            Decision::Forward
        } else {
            tracing::debug!("dropped scan packet from {}", Ipv4Addr::from(outside));
            Decision::DropBlocked
        }
    }
}
