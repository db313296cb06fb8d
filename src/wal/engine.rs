//! The transactional WAL engine: reserve/commit/replay/checkpoint (spec
//! §4.G).
//!
//! Grounded on `bio_wal_reserve`/`bio_wal_commit`/`bio_wal_replay`/
//! `bio_wal_checkpoint` in the original source's `bio_wal.c`. FIFO
//! commit-visibility with skip-on-failure (`wal_tx_completion`) is
//! reproduced here with an async `Mutex`-guarded pending queue instead of
//! the original's per-xstream single-threaded assumption, since this crate
//! lets callers commit concurrently from multiple tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use super::action::{Action, Opcode};
use super::format::{
    calc_trans_blks, id2off, id2seq, id_is_before, seqoff2id, wal_next_id, WalHeader, WalTransEntry, WalTransHead,
    WalTransTail, WAL_BLK_MAGIC, WAL_BLOCK_SZ, WAL_HDR_FL_NO_TAIL, WAL_HDR_MAGIC, WAL_MAX_TRANS_BLKS, WAL_VERSION,
};
use crate::crc::crc32_multi;
use crate::device::{BlobId, BlobTarget, IoChannelId};
use crate::error::{Error, Result};
use crate::faultinject::{FaultInjector, FaultPoint};

/// A reserved but not-yet-committed transaction slot (spec §4.G.1).
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    /// The tx-id assigned to this reservation.
    pub id: u64,
    /// Block count this transaction will occupy.
    pub blks: u32,
    /// Block index (relative to the transaction's first block) where the
    /// payload begins.
    pub payload_idx: u32,
    /// Byte offset within `payload_idx` of the first payload byte.
    pub payload_off: u32,
    /// Byte offset within the final block of the tail checksum.
    pub tail_off: u32,
}

/// Callback invoked once per replayed [`Action`] (spec §4.G.5). `Csum`
/// actions are never handed to this callback: they are the engine's own
/// bookkeeping, not data to be replayed (spec §3).
pub trait ReplayCallback {
    /// Applies one replayed action to the meta-context's in-memory state.
    fn apply(&mut self, id: u64, action: &Action) -> Result<()>;
}

/// Outcome of a checkpoint call (spec §9, resolving the "does checkpoint
/// unmap synchronously" open question: checkpoint always persists the new
/// header before returning, but the freed-region unmap is best-effort and
/// its own failure is reported separately rather than failing the
/// checkpoint as a whole).
#[derive(Debug)]
pub struct CheckpointOutcome {
    /// Whether the unmap of the newly-freed block range succeeded.
    pub unmap: Result<()>,
    /// Whether the updated header was durably flushed.
    pub header_flushed: bool,
}

struct State {
    gen: u32,
    tot_blks: u64,
    unused_id: u64,
    ckp_id: u64,
    /// Block count of the transaction at `ckp_id`, so replay can resume at
    /// `wal_next_id(ckp_id, ckp_blks)` rather than re-reading an already
    /// checkpointed (and possibly reclaimed) transaction (spec §4.G.5,
    /// §4.G.6).
    ckp_blks: u32,
    commit_id: u64,
    /// Block count of the transaction at `commit_id`, mirroring `ckp_blks`
    /// (spec invariant `wal_next_id(commit_id, commit_blks) == unused_id`
    /// whenever no tx is in flight).
    commit_blks: u32,
    outstanding_blks: u64,
    tx_failed: bool,
    force_fail_next: bool,
    pending: VecDeque<u64>,
    outcomes: HashMap<u64, Result<()>>,
    waiters: HashMap<u64, oneshot::Sender<Result<()>>>,
    /// Block count reserved for each pending/outstanding tx-id, consulted
    /// when a commit finalizes so `commit_blks` can be updated.
    blks_of: HashMap<u64, u32>,
    no_tail: bool,
}

/// The write-ahead log engine for one meta-context (spec §4.G).
pub struct WalEngine<D: BlobTarget> {
    device: Arc<D>,
    channel: IoChannelId,
    blob: BlobId,
    state: AsyncMutex<State>,
    faults: Arc<FaultInjector>,
}

impl<D: BlobTarget> WalEngine<D> {
    /// Formats a fresh WAL blob: writes an initial header with `tot_blks`
    /// blocks, generation `gen`, and opens the engine over it (spec §4.G.6
    /// "format").
    pub async fn format(
        device: Arc<D>,
        channel: IoChannelId,
        blob: BlobId,
        tot_blks: u64,
        gen: u32,
        no_tail: bool,
        faults: Arc<FaultInjector>,
    ) -> Result<Self> {
        let flags = if no_tail { WAL_HDR_FL_NO_TAIL } else { 0 };
        let hdr = WalHeader {
            magic: WAL_HDR_MAGIC,
            version: WAL_VERSION,
            gen,
            blk_bytes: WAL_BLOCK_SZ as u16,
            flags,
            tot_blks,
            ckp_id: 0,
            commit_id: 0,
            ckp_blks: 0,
            commit_blks: 0,
        };
        let bytes = hdr.to_bytes();
        device.write(channel, blob, 0, &bytes).await?;

        Ok(Self {
            device,
            channel,
            blob,
            faults,
            state: AsyncMutex::new(State {
                gen,
                tot_blks,
                unused_id: 0,
                ckp_id: 0,
                ckp_blks: 0,
                commit_id: 0,
                commit_blks: 0,
                outstanding_blks: 0,
                tx_failed: false,
                force_fail_next: false,
                pending: VecDeque::new(),
                outcomes: HashMap::new(),
                waiters: HashMap::new(),
                blks_of: HashMap::new(),
                no_tail,
            }),
        })
    }

    /// Opens an already-formatted WAL blob, reading and validating its
    /// header (spec §4.G.6 "open").
    pub async fn open(
        device: Arc<D>,
        channel: IoChannelId,
        blob: BlobId,
        faults: Arc<FaultInjector>,
    ) -> Result<Self> {
        let mut buf = vec![0u8; WalHeader::WIRE_SIZE];
        device.read(channel, blob, 0, &mut buf).await?;
        let hdr = WalHeader::from_bytes(&buf)?;
        Ok(Self {
            device,
            channel,
            blob,
            faults,
            state: AsyncMutex::new(State {
                gen: hdr.gen,
                tot_blks: hdr.tot_blks,
                unused_id: wal_next_id(hdr.tot_blks, hdr.commit_id, hdr.commit_blks),
                ckp_id: hdr.ckp_id,
                ckp_blks: hdr.ckp_blks,
                commit_id: hdr.commit_id,
                commit_blks: hdr.commit_blks,
                outstanding_blks: blocks_between(
                    hdr.tot_blks,
                    wal_next_id(hdr.tot_blks, hdr.ckp_id, hdr.ckp_blks),
                    wal_next_id(hdr.tot_blks, hdr.commit_id, hdr.commit_blks),
                ),
                tx_failed: false,
                force_fail_next: false,
                pending: VecDeque::new(),
                outcomes: HashMap::new(),
                waiters: HashMap::new(),
                blks_of: HashMap::new(),
                no_tail: hdr.no_tail_checksum(),
            }),
        })
    }

    /// Reserves space for a transaction with `act_nr` actions and
    /// `payload_bytes` total payload. Returns [`Error::Again`] when the WAL
    /// has no room (caller should checkpoint and retry), or
    /// [`Error::Busy`] while a prior failure's chain is still draining
    /// (spec §4.G.1, §4.G.4).
    pub async fn reserve(&self, act_nr: u32, payload_bytes: u32) -> Result<Reservation> {
        let mut st = self.state.lock().await;
        if st.tx_failed {
            return Err(Error::Busy("WAL is draining a failed transaction chain".into()));
        }
        let desc = calc_trans_blks(act_nr, payload_bytes, WAL_BLOCK_SZ);
        if desc.blks > WAL_MAX_TRANS_BLKS {
            return Err(Error::Inval(format!(
                "transaction needs {} blocks, exceeds WAL_MAX_TRANS_BLKS={WAL_MAX_TRANS_BLKS}",
                desc.blks
            )));
        }
        if st.outstanding_blks + u64::from(desc.blks) > st.tot_blks {
            return Err(Error::Again);
        }
        let id = st.unused_id;
        st.unused_id = wal_next_id(st.tot_blks, id, desc.blks);
        st.outstanding_blks += u64::from(desc.blks);
        st.pending.push_back(id);
        st.blks_of.insert(id, desc.blks);
        Ok(Reservation {
            id,
            blks: desc.blks,
            payload_idx: desc.payload_idx,
            payload_off: desc.payload_off,
            tail_off: desc.tail_off,
        })
    }

    /// Commits a reserved transaction's `actions` (spec §4.G.3). `actions`
    /// must already include any synthetic [`Action::Csum`] entries the
    /// caller generated for in-flight data writes. Returns once this
    /// transaction's place in FIFO order has been finalized — which may
    /// report failure even if the physical write succeeded, if an earlier
    /// transaction in the chain failed (spec §4.G.4 "skip on failure").
    pub async fn commit(&self, reservation: Reservation, actions: &[Action]) -> Result<()> {
        let phys_result = self.write_transaction(reservation, actions).await;

        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state.lock().await;
            st.outcomes.insert(reservation.id, phys_result);
            st.waiters.insert(reservation.id, tx);
            self.drain_pending(&mut st);
        }
        rx.await.unwrap_or(Err(Error::Shutdown))
    }

    fn drain_pending(&self, st: &mut State) {
        loop {
            let Some(&front) = st.pending.front() else {
                st.tx_failed = false;
                break;
            };
            let Some(outcome) = st.outcomes.remove(&front) else {
                break;
            };
            st.pending.pop_front();
            let blks = st.blks_of.remove(&front).unwrap_or(0);

            let forced = st.force_fail_next;
            st.force_fail_next = false;
            let final_result = if forced {
                outcome.ok();
                Err(Error::NvmeIo("WAL transaction skipped: predecessor failed".into()))
            } else {
                outcome
            };

            match &final_result {
                Ok(()) => {
                    st.commit_id = front;
                    st.commit_blks = blks;
                }
                Err(e) => {
                    warn!(id = front, error = %e, "WAL transaction finalized with failure");
                    // Only roll back if this tx is actually behind the
                    // current `unused_id` — a forced-failure cascade
                    // revisits this arm for every doomed successor, and a
                    // later successor's own id must not drag `unused_id`
                    // forward past an earlier one's rollback target
                    // (mirrors `bio_wal.c`'s `wal_id_cmp`-guarded
                    // assignment in `wal_tx_completion`).
                    if id_is_before(st.tot_blks, front, st.unused_id) {
                        st.unused_id = front;
                    }
                    st.tx_failed = true;
                    st.force_fail_next = true;
                }
            }
            if let Some(waiter) = st.waiters.remove(&front) {
                let _ = waiter.send(match &final_result {
                    Ok(()) => Ok(()),
                    Err(_) => Err(Error::NvmeIo("WAL transaction failed".into())),
                });
            }
            if st.pending.is_empty() {
                st.tx_failed = false;
            }
        }
    }

    async fn write_transaction(&self, reservation: Reservation, actions: &[Action]) -> Result<()> {
        if self.faults.check(FaultPoint::WalTxLost) {
            debug!(id = reservation.id, "fault-injected WAL tx loss: skipping physical write");
            return Ok(());
        }

        let st = self.state.lock().await;
        let (gen, tot_blks, no_tail) = (st.gen, st.tot_blks, st.no_tail);
        drop(st);

        let mut buf = vec![0u8; reservation.blks as usize * WAL_BLOCK_SZ as usize];

        let head = WalTransHead {
            magic: WAL_BLK_MAGIC,
            gen,
            id: reservation.id,
            tot_ents: actions.len() as u32,
            tot_payload: actions.iter().map(|a| a.payload_len() as u32).sum(),
        };
        buf[0..WalTransHead::WIRE_SIZE].copy_from_slice(&head.to_bytes());

        let mut ent_off = WalTransHead::WIRE_SIZE;
        let mut payload_cursor = reservation.payload_idx as usize * WAL_BLOCK_SZ as usize
            + reservation.payload_off as usize;
        for action in actions {
            let entry = to_wire_entry(action, payload_cursor as u64);
            if ent_off + WalTransEntry::WIRE_SIZE > buf.len() {
                return Err(Error::Inval("entry region overflowed reserved blocks".into()));
            }
            buf[ent_off..ent_off + WalTransEntry::WIRE_SIZE].copy_from_slice(&entry.to_bytes());
            ent_off += WalTransEntry::WIRE_SIZE;
            if let Some(payload) = action_payload(action) {
                buf[payload_cursor..payload_cursor + payload.len()].copy_from_slice(&payload);
                payload_cursor += payload.len();
            }
        }

        if !no_tail {
            let csum = crc32_multi(&[&buf[..payload_cursor.min(buf.len())]]);
            let tail = WalTransTail { csum };
            let tail_off = reservation.tail_off as usize;
            buf[tail_off..tail_off + WalTransTail::WIRE_SIZE].copy_from_slice(&csum.to_le_bytes());
            let _ = tail;
        }

        if self.faults.check(FaultPoint::WriteErr) {
            return Err(Error::NvmeIo("fault-injected WAL write error".into()));
        }

        self.write_wrapped(id2off(reservation.id), reservation.blks, &buf, tot_blks)
            .await
    }

    async fn write_wrapped(&self, start_blk: u32, blks: u32, buf: &[u8], tot_blks: u64) -> Result<()> {
        let blk_sz = u64::from(WAL_BLOCK_SZ);
        let start_off = 1 + u64::from(start_blk); // block 0 is the WAL header
        let first_run = (tot_blks - 1 - u64::from(start_blk)).min(u64::from(blks));
        let first_bytes = first_run as usize * WAL_BLOCK_SZ as usize;
        self.device
            .write(self.channel, self.blob, start_off * blk_sz, &buf[..first_bytes])
            .await?;
        if first_bytes < buf.len() {
            self.device
                .write(self.channel, self.blob, blk_sz, &buf[first_bytes..])
                .await?;
        }
        Ok(())
    }

    /// Replays every committed-but-not-yet-applied action since the last
    /// checkpoint into `callback`, stopping cleanly at the first invalid
    /// header (a "hole": space that was reserved but never durably
    /// committed, spec §4.G.5, §8 hole-detection scenario).
    pub async fn replay(&self, callback: &mut dyn ReplayCallback) -> Result<u64> {
        let (mut cursor, gen, tot_blks, no_tail) = {
            let st = self.state.lock().await;
            (wal_next_id(st.tot_blks, st.ckp_id, st.ckp_blks), st.gen, st.tot_blks, st.no_tail)
        };
        let mut replayed = 0u64;

        loop {
            let blk_off = 1 + u64::from(id2off(cursor));
            let mut head_buf = vec![0u8; WalTransHead::WIRE_SIZE];
            if self
                .device
                .read(self.channel, self.blob, blk_off * u64::from(WAL_BLOCK_SZ), &mut head_buf)
                .await
                .is_err()
            {
                break;
            }
            let head = match WalTransHead::from_bytes(&head_buf) {
                Ok(h) if h.magic == WAL_BLK_MAGIC && h.gen == gen && h.id == cursor => h,
                _ => break, // hole: stale or zeroed block, stop replay here
            };

            let desc = calc_trans_blks(head.tot_ents.max(1), head.tot_payload, WAL_BLOCK_SZ);
            let mut tx_buf = vec![0u8; desc.blks as usize * WAL_BLOCK_SZ as usize];
            if self
                .read_wrapped(id2off(cursor), desc.blks, &mut tx_buf, tot_blks)
                .await
                .is_err()
            {
                break;
            }

            if !no_tail {
                let tail_off = desc.tail_off as usize;
                let stored = u32::from_le_bytes(tx_buf[tail_off..tail_off + 4].try_into().unwrap());
                let region_end = desc.payload_idx as usize * WAL_BLOCK_SZ as usize + desc.payload_off as usize
                    + head.tot_payload as usize;
                let computed = crc32_multi(&[&tx_buf[..region_end.min(tx_buf.len())]]);
                if stored != computed {
                    break; // hole: payload/header committed but tail never landed
                }
            }

            let mut ent_off = WalTransHead::WIRE_SIZE;
            let mut payload_cursor =
                desc.payload_idx as usize * WAL_BLOCK_SZ as usize + desc.payload_off as usize;
            for _ in 0..head.tot_ents {
                let entry = WalTransEntry::from_bytes(&tx_buf[ent_off..ent_off + WalTransEntry::WIRE_SIZE])?;
                ent_off += WalTransEntry::WIRE_SIZE;
                let Some(op) = Opcode::from_u16(entry.op_type) else {
                    break;
                };
                let action = from_wire_entry(op, &entry, &tx_buf, &mut payload_cursor);
                if !matches!(action, Action::Csum { .. }) {
                    callback.apply(cursor, &action)?;
                }
            }

            replayed += 1;
            let next = wal_next_id(tot_blks, cursor, desc.blks);
            {
                let mut st = self.state.lock().await;
                st.commit_id = cursor;
                st.commit_blks = desc.blks;
            }
            cursor = next;
        }

        // Scrub the trailing window past the hole (or end-of-log) so a
        // same-or-smaller future transaction reusing this offset range
        // can't resurrect a stale, previously-written-but-abandoned tx
        // whose header still carries a matching generation (spec §4.G.5
        // "After replay, unmap ..."; spec §8 hole-detection scenario).
        let scrub_blks = u64::from(WAL_MAX_TRANS_BLKS).min(tot_blks.saturating_sub(1));
        if let Err(e) = self.unmap_range(cursor, scrub_blks, tot_blks).await {
            warn!(error = %e, cursor, "failed to unmap trailing WAL range after replay");
        }

        let mut st = self.state.lock().await;
        st.unused_id = cursor;
        st.outstanding_blks = blocks_between(tot_blks, wal_next_id(tot_blks, st.ckp_id, st.ckp_blks), cursor);
        Ok(replayed)
    }

    async fn read_wrapped(&self, start_blk: u32, blks: u32, buf: &mut [u8], tot_blks: u64) -> Result<()> {
        let blk_sz = u64::from(WAL_BLOCK_SZ);
        let start_off = 1 + u64::from(start_blk);
        let first_run = (tot_blks - 1 - u64::from(start_blk)).min(u64::from(blks));
        let first_bytes = first_run as usize * WAL_BLOCK_SZ as usize;
        self.device
            .read(self.channel, self.blob, start_off * blk_sz, &mut buf[..first_bytes])
            .await?;
        if first_bytes < buf.len() {
            self.device
                .read(self.channel, self.blob, blk_sz, &mut buf[first_bytes..])
                .await?;
        }
        Ok(())
    }

    /// Advances the checkpoint to `new_ckp_id`, unmapping the newly-freed
    /// block range (through the checkpointed transaction's own blocks) and
    /// flushing the updated header (spec §4.G.6, §4.G.7, §9).
    pub async fn checkpoint(&self, new_ckp_id: u64) -> Result<CheckpointOutcome> {
        let (gen, tot_blks, old_ckp_id, old_ckp_blks) = {
            let st = self.state.lock().await;
            (st.gen, st.tot_blks, st.ckp_id, st.ckp_blks)
        };

        // Re-read the checkpointed transaction's own header from disk to
        // recompute its block span — `ckp_blks` must reflect the tx at
        // `new_ckp_id` itself, not the distance since the previous
        // checkpoint, so replay can resume exactly past it.
        let blk_off = 1 + u64::from(id2off(new_ckp_id));
        let mut head_buf = vec![0u8; WalTransHead::WIRE_SIZE];
        self.device
            .read(self.channel, self.blob, blk_off * u64::from(WAL_BLOCK_SZ), &mut head_buf)
            .await?;
        let head = WalTransHead::from_bytes(&head_buf)?;
        if head.magic != WAL_BLK_MAGIC || head.gen != gen || head.id != new_ckp_id {
            return Err(Error::Inval(format!(
                "checkpoint target {new_ckp_id} has no valid transaction header on disk"
            )));
        }
        let ckp_blks = calc_trans_blks(head.tot_ents.max(1), head.tot_payload, WAL_BLOCK_SZ).blks;

        // Free the range from just past the previous checkpoint's own
        // blocks through this checkpoint's own blocks (spec §4.G.6: "the
        // block after the previous checkpoint through the block after the
        // given tx-id").
        let unmap_from = wal_next_id(tot_blks, old_ckp_id, old_ckp_blks);
        let unmap_through = wal_next_id(tot_blks, new_ckp_id, ckp_blks);
        let freed = blocks_between(tot_blks, unmap_from, unmap_through);

        let mut st = self.state.lock().await;
        st.ckp_id = new_ckp_id;
        st.ckp_blks = ckp_blks;
        st.outstanding_blks = st.outstanding_blks.saturating_sub(freed);
        let (commit_id, commit_blks, no_tail) = (st.commit_id, st.commit_blks, st.no_tail);
        drop(st);

        let unmap = self.unmap_range(unmap_from, freed, tot_blks).await;

        let hdr = WalHeader {
            magic: WAL_HDR_MAGIC,
            version: WAL_VERSION,
            gen,
            blk_bytes: WAL_BLOCK_SZ as u16,
            flags: if no_tail { WAL_HDR_FL_NO_TAIL } else { 0 },
            tot_blks,
            ckp_id: new_ckp_id,
            commit_id,
            ckp_blks,
            commit_blks,
        };
        let header_flushed = self
            .device
            .write(self.channel, self.blob, 0, &hdr.to_bytes())
            .await
            .is_ok();

        Ok(CheckpointOutcome { unmap, header_flushed })
    }

    async fn unmap_range(&self, start_id: u64, blks: u64, tot_blks: u64) -> Result<()> {
        if blks == 0 {
            return Ok(());
        }
        let start_off = 1 + u64::from(id2off(start_id));
        let first_run = (tot_blks - 1 - u64::from(id2off(start_id))).min(blks);
        self.device
            .unmap(
                self.channel,
                self.blob,
                start_off * u64::from(WAL_BLOCK_SZ),
                first_run * u64::from(WAL_BLOCK_SZ),
            )
            .await?;
        if first_run < blks {
            self.device
                .unmap(
                    self.channel,
                    self.blob,
                    u64::from(WAL_BLOCK_SZ),
                    (blks - first_run) * u64::from(WAL_BLOCK_SZ),
                )
                .await?;
        }
        Ok(())
    }

    /// Re-flushes the current header verbatim, e.g. after reopening.
    pub async fn flush_header(&self) -> Result<()> {
        let st = self.state.lock().await;
        let hdr = WalHeader {
            magic: WAL_HDR_MAGIC,
            version: WAL_VERSION,
            gen: st.gen,
            blk_bytes: WAL_BLOCK_SZ as u16,
            flags: if st.no_tail { WAL_HDR_FL_NO_TAIL } else { 0 },
            tot_blks: st.tot_blks,
            ckp_id: st.ckp_id,
            commit_id: st.commit_id,
            ckp_blks: st.ckp_blks,
            commit_blks: st.commit_blks,
        };
        drop(st);
        self.device.write(self.channel, self.blob, 0, &hdr.to_bytes()).await
    }

    /// Last durably committed tx-id, as seen by finalized FIFO order.
    pub async fn commit_id(&self) -> u64 {
        self.state.lock().await.commit_id
    }

    /// Last checkpointed tx-id.
    pub async fn ckp_id(&self) -> u64 {
        self.state.lock().await.ckp_id
    }
}

fn blocks_between(tot_blks: u64, from_id: u64, to_id: u64) -> u64 {
    let seq_diff = id2seq(to_id).wrapping_sub(id2seq(from_id));
    u64::from(seq_diff) * tot_blks + u64::from(id2off(to_id)) - u64::from(id2off(from_id))
}

fn action_payload(action: &Action) -> Option<Vec<u8>> {
    match action {
        Action::Copy { payload, .. } | Action::CopyPtr { payload, .. } => Some(payload.clone()),
        Action::Move { src, .. } => Some(src.to_le_bytes().to_vec()),
        _ => None,
    }
}

fn to_wire_entry(action: &Action, payload_off: u64) -> WalTransEntry {
    match action {
        Action::Copy { addr, .. } | Action::CopyPtr { addr, .. } => WalTransEntry {
            off: *addr,
            len: action.payload_len() as u32,
            data: (payload_off & 0xFFFF_FFFF) as u32,
            op_type: action.opcode() as u16,
        },
        Action::Assign { addr, size, value } => WalTransEntry {
            off: *addr,
            len: u32::from(*size),
            data: *value,
            op_type: action.opcode() as u16,
        },
        Action::Move { dst, size, .. } => WalTransEntry {
            off: *dst,
            len: *size,
            data: (payload_off & 0xFFFF_FFFF) as u32,
            op_type: action.opcode() as u16,
        },
        Action::Set { addr, value, size } => WalTransEntry {
            off: *addr,
            len: *size,
            data: u32::from(*value),
            op_type: action.opcode() as u16,
        },
        Action::SetBits { addr, pos, count } | Action::ClrBits { addr, pos, count } => WalTransEntry {
            off: *addr,
            len: 0,
            data: (u32::from(*count) << 8) | u32::from(*pos),
            op_type: action.opcode() as u16,
        },
        Action::Csum { addr, size, expected } => WalTransEntry {
            off: *addr,
            len: *size,
            data: *expected,
            op_type: action.opcode() as u16,
        },
    }
}

fn from_wire_entry(op: Opcode, entry: &WalTransEntry, tx_buf: &[u8], payload_cursor: &mut usize) -> Action {
    match op {
        Opcode::Copy | Opcode::CopyPtr => {
            let len = entry.len as usize;
            let payload = tx_buf[*payload_cursor..*payload_cursor + len].to_vec();
            *payload_cursor += len;
            if matches!(op, Opcode::Copy) {
                Action::Copy { addr: entry.off, payload }
            } else {
                Action::CopyPtr { addr: entry.off, payload }
            }
        }
        Opcode::Assign => Action::Assign {
            addr: entry.off,
            size: entry.len as u8,
            value: entry.data,
        },
        Opcode::Move => {
            let src = u64::from_le_bytes(tx_buf[*payload_cursor..*payload_cursor + 8].try_into().unwrap());
            *payload_cursor += 8;
            Action::Move {
                dst: entry.off,
                src,
                size: entry.len,
            }
        }
        Opcode::Set => Action::Set {
            addr: entry.off,
            value: entry.data as u8,
            size: entry.len,
        },
        Opcode::SetBits => Action::SetBits {
            addr: entry.off,
            pos: (entry.data & 0xFF) as u8,
            count: ((entry.data >> 8) & 0xFF) as u8,
        },
        Opcode::ClrBits => Action::ClrBits {
            addr: entry.off,
            pos: (entry.data & 0xFF) as u8,
            count: ((entry.data >> 8) & 0xFF) as u8,
        },
        Opcode::Csum => Action::Csum {
            addr: entry.off,
            size: entry.len,
            expected: entry.data,
        },
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::device::mock::MockBlobTarget;

    async fn new_engine(tot_blks: u64) -> (Arc<MockBlobTarget>, WalEngine<MockBlobTarget>) {
        let dev = Arc::new(MockBlobTarget::new(4096, 32 << 20));
        let blob = dev.create(tot_blks * u64::from(WAL_BLOCK_SZ)).await.unwrap();
        dev.open(blob).await.unwrap();
        let ch = dev.alloc_io_channel().await.unwrap();
        let faults = Arc::new(FaultInjector::new());
        let engine = WalEngine::format(dev.clone(), ch, blob, tot_blks, 1, false, faults)
            .await
            .unwrap();
        (dev, engine)
    }

    struct Recorder(Vec<Action>);
    impl ReplayCallback for Recorder {
        fn apply(&mut self, _id: u64, action: &Action) -> Result<()> {
            self.0.push(action.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn single_transaction_commits_and_replays() {
        let (_dev, engine) = new_engine(64).await;
        let actions = vec![Action::Copy {
            addr: 128,
            payload: vec![1, 2, 3, 4],
        }];
        let desc_len = actions[0].payload_len() as u32;
        let reservation = engine.reserve(1, desc_len).await.unwrap();
        engine.commit(reservation, &actions).await.unwrap();
        assert_eq!(engine.commit_id().await, reservation.id);

        let mut rec = Recorder(Vec::new());
        let replayed = engine.replay(&mut rec).await.unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(rec.0.len(), 1);
    }

    /// Spec §8 scenario 4: inject on the 2nd of 3 commits. Commit #1 must
    /// succeed, #2 must surface the injected error, and #3 — its
    /// immediate successor in FIFO order — must be forced to fail too,
    /// even though its own write never hit the fault. `commit_id` must
    /// stall at #1, and the next `reserve` must hand back #2's released
    /// id, not #3's (the FIFO-rollback regression this test guards).
    #[tokio::test]
    async fn failed_transaction_propagates_to_immediate_successor() {
        let (dev, engine) = new_engine(64).await;
        let a1 = vec![Action::Assign {
            addr: 0,
            size: 4,
            value: 1,
        }];
        let a2 = vec![Action::Assign {
            addr: 8,
            size: 4,
            value: 2,
        }];
        let a3 = vec![Action::Assign {
            addr: 16,
            size: 4,
            value: 3,
        }];

        let r1 = engine.reserve(1, 0).await.unwrap();
        let res1 = engine.commit(r1, &a1).await;
        assert!(res1.is_ok(), "first transaction commits cleanly");

        let r2 = engine.reserve(1, 0).await.unwrap();
        dev.faults().arm(FaultPoint::WriteErr, 1);
        let res2 = engine.commit(r2, &a2).await;
        assert!(res2.is_err(), "second transaction hits the injected fault");

        let r3 = engine.reserve(1, 0).await.unwrap();
        let res3 = engine.commit(r3, &a3).await;
        assert!(res3.is_err(), "immediate successor must be forced to fail too");

        assert_eq!(engine.commit_id().await, r1.id, "commit_id stalls at the last good tx");

        let r4 = engine.reserve(1, 0).await.unwrap();
        assert_eq!(r4.id, r2.id, "the failed tx's id must be released for the next reservation, not r3's");
    }

    #[tokio::test]
    async fn checkpoint_unmaps_and_flushes_header() {
        let (_dev, engine) = new_engine(64).await;
        let actions = vec![Action::Assign {
            addr: 0,
            size: 4,
            value: 7,
        }];
        let reservation = engine.reserve(1, 0).await.unwrap();
        let id = reservation.id;
        engine.commit(reservation, &actions).await.unwrap();
        let outcome = engine.checkpoint(id).await.unwrap();
        assert!(outcome.header_flushed);
        assert!(outcome.unmap.is_ok());
        assert_eq!(engine.ckp_id().await, id);
    }

    async fn new_engine_with_blob(
        tot_blks: u64,
    ) -> (Arc<MockBlobTarget>, IoChannelId, BlobId, Arc<FaultInjector>, WalEngine<MockBlobTarget>) {
        let dev = Arc::new(MockBlobTarget::new(4096, 32 << 20));
        let blob = dev.create(tot_blks * u64::from(WAL_BLOCK_SZ)).await.unwrap();
        dev.open(blob).await.unwrap();
        let ch = dev.alloc_io_channel().await.unwrap();
        let faults = Arc::new(FaultInjector::new());
        let engine = WalEngine::format(dev.clone(), ch, blob, tot_blks, 1, false, faults.clone())
            .await
            .unwrap();
        (dev, ch, blob, faults, engine)
    }

    /// Spec §8 scenario 2: a transaction large enough that its entries
    /// alone span more than one WAL block.
    #[tokio::test]
    async fn many_actions_span_multiple_wal_blocks() {
        let (_dev, _ch, _blob, _faults, engine) = new_engine_with_blob(64).await;
        let actions: Vec<Action> = (0..300u64)
            .map(|i| Action::Copy {
                addr: i * 8,
                payload: vec![(i % 251) as u8; 8],
            })
            .collect();
        let payload_bytes: u32 = actions.iter().map(|a| a.payload_len() as u32).sum();
        let reservation = engine.reserve(actions.len() as u32, payload_bytes).await.unwrap();
        assert!(
            reservation.blks > 1,
            "300 actions at 18 bytes/entry must overflow a single 4 KiB block"
        );
        engine.commit(reservation, &actions).await.unwrap();
        assert_eq!(engine.commit_id().await, reservation.id);

        let mut rec = Recorder(Vec::new());
        let replayed = engine.replay(&mut rec).await.unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(rec.0, actions);
    }

    /// Spec §8 scenario 3: a 1 MiB payload delivered via `COPY_PTR`,
    /// which must replay back as `COPY` with byte-identical bytes.
    #[tokio::test]
    async fn large_payload_round_trips_as_copy() {
        let (_dev, _ch, _blob, _faults, engine) = new_engine_with_blob(1024).await;
        let big: Vec<u8> = (0..(1 << 20)).map(|i| (i % 251) as u8).collect();
        let actions = vec![
            Action::Assign {
                addr: 0,
                size: 4,
                value: 0xAABB_CCDD,
            },
            Action::CopyPtr {
                addr: 64,
                payload: big.clone(),
            },
            Action::Copy {
                addr: 128,
                payload: vec![1, 2, 3, 4, 5, 6, 7, 8],
            },
            Action::CopyPtr {
                addr: 256,
                payload: big.clone(),
            },
            Action::Set {
                addr: 512,
                value: 0xAB,
                size: 16,
            },
        ];
        let payload_bytes: u32 = actions.iter().map(|a| a.payload_len() as u32).sum();
        let reservation = engine.reserve(actions.len() as u32, payload_bytes).await.unwrap();
        engine.commit(reservation, &actions).await.unwrap();
        assert_eq!(engine.commit_id().await, reservation.id);

        let mut rec = Recorder(Vec::new());
        let replayed = engine.replay(&mut rec).await.unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(rec.0.len(), 5);
        for idx in [1, 3] {
            match &rec.0[idx] {
                Action::Copy { payload, .. } => assert_eq!(payload, &big, "COPY_PTR must replay byte-identical"),
                other => panic!("expected COPY_PTR delivered as COPY at index {idx}, got {other:?}"),
            }
        }
    }

    /// Spec §8 scenario 5: 20 txs of 7 mixed actions each, checkpointed at
    /// tx #10. Reopen and replay must deliver exactly txs #11..#20, in
    /// order, and the reopened engine's `ckp_id` must equal tx #10's id.
    #[tokio::test]
    async fn checkpoint_then_replay_delivers_only_txs_after_checkpoint() {
        let (dev, ch, blob, faults, engine) = new_engine_with_blob(512).await;
        let mut ids = Vec::with_capacity(20);
        for tx in 0..20u64 {
            let actions: Vec<Action> = (0..7u64)
                .map(|i| Action::Assign {
                    addr: (tx * 7 + i) * 8,
                    size: 4,
                    value: (tx * 7 + i) as u32,
                })
                .collect();
            let reservation = engine.reserve(actions.len() as u32, 0).await.unwrap();
            engine.commit(reservation, &actions).await.unwrap();
            ids.push(reservation.id);
        }
        engine.checkpoint(ids[9]).await.unwrap();

        let reopened = WalEngine::open(dev.clone(), ch, blob, faults.clone()).await.unwrap();
        assert_eq!(reopened.ckp_id().await, ids[9]);

        let mut rec = Recorder(Vec::new());
        let replayed = reopened.replay(&mut rec).await.unwrap();
        assert_eq!(replayed, 10, "only txs #11..#20 should replay");
        assert_eq!(rec.0.len(), 70);
        for (i, action) in rec.0.iter().enumerate() {
            let expected = 10 * 7 + i as u64;
            match action {
                Action::Assign { value, .. } => assert_eq!(*value, expected as u32),
                other => panic!("unexpected action {other:?}"),
            }
        }
    }

    /// Spec §8 scenario 6: enough small transactions, checkpointed in
    /// batches, that the log wraps its sequence number more than once;
    /// only the final, uncheckpointed batch survives a reopen+replay.
    #[tokio::test]
    async fn wrap_around_replays_only_the_final_uncheckpointed_batch() {
        let (dev, ch, blob, faults, engine) = new_engine_with_blob(16).await;
        const BATCH: usize = 5;
        const BATCHES: usize = 6;
        let mut last_committed_in_batch = 0u64;
        let mut max_seq_seen = 0u32;
        for batch in 0..BATCHES {
            for i in 0..BATCH {
                let reservation = engine.reserve(1, 0).await.unwrap();
                max_seq_seen = max_seq_seen.max(id2seq(reservation.id));
                let action = vec![Action::Assign {
                    addr: (batch * BATCH + i) as u64 * 8,
                    size: 4,
                    value: (batch * BATCH + i) as u32,
                }];
                engine.commit(reservation, &action).await.unwrap();
                last_committed_in_batch = reservation.id;
            }
            if batch + 1 < BATCHES {
                engine.checkpoint(last_committed_in_batch).await.unwrap();
            }
        }
        assert!(max_seq_seen > 0, "30 one-block txs through a 15-block log must wrap sequence");

        let reopened = WalEngine::open(dev.clone(), ch, blob, faults.clone()).await.unwrap();
        let mut rec = Recorder(Vec::new());
        let replayed = reopened.replay(&mut rec).await.unwrap();
        assert_eq!(replayed, BATCH as u64, "only the final, uncheckpointed batch should replay");
        assert_eq!(rec.0.len(), BATCH);
        for (i, action) in rec.0.iter().enumerate() {
            match action {
                Action::Assign { value, .. } => assert_eq!(*value, ((BATCHES - 1) * BATCH + i) as u32),
                other => panic!("unexpected action {other:?}"),
            }
        }
    }

    /// Spec §8 scenario 7: a fault-injected tx loss leaves a hole; replay
    /// stops cleanly at it, and a later commit reusing the freed slot
    /// replays on its own once the stale successor has been scrubbed.
    #[tokio::test]
    async fn hole_in_the_log_stops_replay_and_is_reclaimed() {
        let (dev, ch, blob, faults, engine) = new_engine_with_blob(16).await;

        faults.arm(FaultPoint::WalTxLost, 1);
        let r1 = engine.reserve(1, 0).await.unwrap();
        let tx1_id = r1.id;
        engine
            .commit(r1, &[Action::Assign { addr: 0, size: 4, value: 1 }])
            .await
            .unwrap();

        let r2 = engine.reserve(1, 0).await.unwrap();
        engine
            .commit(r2, &[Action::Assign { addr: 8, size: 4, value: 2 }])
            .await
            .unwrap();

        // Neither checkpoint nor flush_header ran: on reopen the header
        // still reports ckp_id = commit_id = 0, so replay starts at tx1's
        // slot and finds a hole (tx1 was never physically written).
        let reopened = WalEngine::open(dev.clone(), ch, blob, faults.clone()).await.unwrap();
        let mut rec = Recorder(Vec::new());
        let replayed = reopened.replay(&mut rec).await.unwrap();
        assert_eq!(replayed, 0, "the hole at tx1 must stop replay before tx2");
        assert_eq!(rec.0.len(), 0);

        // Commit tx3 into the slot replay rolled `unused_id` back to —
        // the same slot tx1 occupied.
        let r3 = reopened.reserve(1, 0).await.unwrap();
        assert_eq!(r3.id, tx1_id, "the freed slot must be tx1's original id");
        reopened
            .commit(r3, &[Action::Assign { addr: 16, size: 4, value: 3 }])
            .await
            .unwrap();

        let reopened_again = WalEngine::open(dev.clone(), ch, blob, faults.clone()).await.unwrap();
        let mut rec2 = Recorder(Vec::new());
        let replayed2 = reopened_again.replay(&mut rec2).await.unwrap();
        assert_eq!(replayed2, 1, "only tx3 should replay; tx2 was scrubbed as a stale successor");
        assert_eq!(rec2.0.len(), 1);
        assert_eq!(rec2.0[0], Action::Assign { addr: 16, size: 4, value: 3 });
    }
}
