//! Worker-team communicator.
//!
//! The pipeline stages run as a fixed team of W logical ranks, one OS thread
//! per rank, advancing in lock-step through collective operations: barrier,
//! broadcast, allreduce, gather. Every collective is synchronous and every
//! rank must call it; the stages are written so all ranks reach the same
//! collectives in the same order.
//!
//! Reductions fold the per-rank contributions in rank order on every rank, so
//! floating-point results are identical across ranks and across runs for any
//! thread schedule.

use anyhow::Result;
use bytemuck::Pod;
use memmap2::MmapMut;
use ndarray::Array2;
use std::any::Any;
use std::fs::File;
use std::io::{LineWriter, Write};
use std::marker::PhantomData;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Barrier, Mutex, RwLock};

/// Broadcast payloads at or above this size go through a per-rank
/// memory-mapped temporary instead of in-memory clones.
pub const LARGE_BCAST_BYTES: usize = 1_000_000_000;

struct Shared {
    barrier: Barrier,
    /// One deposit slot per rank, used by reductions and gathers.
    slots: RwLock<Vec<Option<Box<dyn Any + Send + Sync>>>>,
    /// Root deposit slot used by broadcasts.
    bcast: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

/// A fixed-size team of cooperating workers.
pub struct Communicator {
    size: usize,
    scratch_dir: PathBuf,
    large_threshold: usize,
}

impl Communicator {
    pub fn new(size: usize) -> Self {
        Communicator {
            size: size.max(1),
            scratch_dir: std::env::temp_dir(),
            large_threshold: LARGE_BCAST_BYTES,
        }
    }

    /// Directory for per-rank temporary files backing large broadcasts.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Lower the in-memory broadcast cutoff (exercised by tests).
    pub fn with_large_threshold(mut self, bytes: usize) -> Self {
        self.large_threshold = bytes.max(1);
        self
    }

    /// Run `f` on every rank of the team and wait for completion.
    ///
    /// A rank returning an error aborts the whole process with exit code 1
    /// after printing a tagged diagnostic, mirroring a communicator-wide
    /// abort: the surviving ranks would otherwise deadlock at the next
    /// collective.
    pub fn run<F>(&self, f: F)
    where
        F: Fn(Rank) -> Result<()> + Send + Sync,
    {
        let shared = Arc::new(Shared {
            barrier: Barrier::new(self.size),
            slots: RwLock::new((0..self.size).map(|_| None).collect()),
            bcast: Mutex::new(None),
        });
        let scratch = Arc::new(self.scratch_dir.clone());
        std::thread::scope(|scope| {
            for rank_id in 0..self.size {
                let rank = Rank {
                    rank: rank_id,
                    size: self.size,
                    large_threshold: self.large_threshold,
                    shared: Arc::clone(&shared),
                    scratch_dir: Arc::clone(&scratch),
                };
                let f = &f;
                scope.spawn(move || {
                    if let Err(err) = f(rank) {
                        abort(rank_id, &err);
                    }
                });
            }
        });
    }
}

/// Print the tagged diagnostic for a fatal error and terminate the process.
pub fn abort(rank: usize, err: &anyhow::Error) -> ! {
    println!("From process {rank} (ERROR) => {err:#}");
    tracing::error!(rank, "fatal: {err:#}");
    std::process::exit(1);
}

/// Split `total` rows into `nprocs` contiguous segments; rank 0 absorbs the
/// residue. Returns `(sizes, offsets)`.
pub fn partition_rows(total: usize, nprocs: usize) -> (Vec<usize>, Vec<usize>) {
    let base = total / nprocs;
    let mut sizes = vec![base; nprocs];
    sizes[0] = total - (nprocs - 1) * base;
    let mut offsets = vec![0usize; nprocs];
    for r in 1..nprocs {
        offsets[r] = offsets[r - 1] + sizes[r - 1];
    }
    (sizes, offsets)
}

/// Handle held by one worker; all collectives go through this.
pub struct Rank {
    rank: usize,
    size: usize,
    large_threshold: usize,
    shared: Arc<Shared>,
    scratch_dir: Arc<PathBuf>,
}

impl Rank {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    pub fn scratch_dir(&self) -> &PathBuf {
        &self.scratch_dir
    }

    /// Block until every rank has reached this point.
    pub fn barrier(&self) {
        self.shared.barrier.wait();
    }

    /// Broadcast `value` from `root` to every rank. Only the root's `value`
    /// is consulted; the other ranks pass `None`.
    pub fn broadcast<T>(&self, root: usize, value: Option<T>) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        if self.rank == root {
            let boxed: Box<dyn Any + Send + Sync> =
                Box::new(value.expect("broadcast root must supply a value"));
            *self.shared.bcast.lock().unwrap() = Some(boxed);
        }
        self.barrier();
        let out = {
            let guard = self.shared.bcast.lock().unwrap();
            guard
                .as_ref()
                .and_then(|any| any.downcast_ref::<T>())
                .expect("broadcast type mismatch between ranks")
                .clone()
        };
        self.barrier();
        if self.rank == root {
            *self.shared.bcast.lock().unwrap() = None;
        }
        self.barrier();
        out
    }

    /// Element-wise sum of every rank's `local` slice; every rank receives
    /// the same total, folded in rank order.
    pub fn allreduce_sum_f32(&self, local: &[f32]) -> Vec<f32> {
        self.deposit(local.to_vec());
        let mut total = vec![0.0f32; local.len()];
        {
            let slots = self.shared.slots.read().unwrap();
            for slot in slots.iter() {
                let contribution = slot
                    .as_ref()
                    .and_then(|any| any.downcast_ref::<Vec<f32>>())
                    .expect("allreduce type mismatch between ranks");
                for (t, &c) in total.iter_mut().zip(contribution.iter()) {
                    *t += c;
                }
            }
        }
        self.clear_slots();
        total
    }

    /// Gather each rank's row-segment onto `root`, which receives the
    /// segments concatenated in rank order.
    pub fn gatherv_rows(&self, root: usize, segment: Array2<f32>) -> Option<Array2<f32>> {
        let ncols = segment.ncols();
        self.deposit(segment);
        let gathered = if self.rank == root {
            let slots = self.shared.slots.read().unwrap();
            let total_rows: usize = slots
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .and_then(|any| any.downcast_ref::<Array2<f32>>())
                        .expect("gather type mismatch between ranks")
                        .nrows()
                })
                .sum();
            let mut full = Array2::<f32>::zeros((total_rows, ncols));
            let mut begin = 0usize;
            for slot in slots.iter() {
                let part = slot
                    .as_ref()
                    .and_then(|any| any.downcast_ref::<Array2<f32>>())
                    .unwrap();
                full.slice_mut(ndarray::s![begin..begin + part.nrows(), ..])
                    .assign(part);
                begin += part.nrows();
            }
            Some(full)
        } else {
            None
        };
        self.clear_slots();
        gathered
    }

    /// Size-tiered array broadcast: payloads under the threshold are cloned
    /// in memory; larger ones are copied into a per-rank memory-mapped
    /// temporary under the scratch directory (deleted on drop).
    pub fn broadcast_large<T>(&self, root: usize, data: Option<Vec<T>>) -> Result<SharedBuffer<T>>
    where
        T: Pod + Send + Sync + 'static,
    {
        let len: usize = self.broadcast(root, data.as_ref().map(|d| d.len()));
        let bytes = len * std::mem::size_of::<T>();
        let source: Arc<Vec<T>> = self.broadcast(root, data.map(Arc::new));

        if bytes < self.large_threshold {
            let out = if self.rank == root {
                // Everyone else has dropped their handle at the barrier
                // inside broadcast; recover the allocation when possible.
                Arc::try_unwrap(source).unwrap_or_else(|arc| arc.as_ref().clone())
            } else {
                source.as_ref().clone()
            };
            return Ok(SharedBuffer::Owned(out));
        }

        if self.rank == root {
            let out = Arc::try_unwrap(source).unwrap_or_else(|arc| arc.as_ref().clone());
            return Ok(SharedBuffer::Owned(out));
        }
        let file = tempfile::tempfile_in(self.scratch_dir.as_path())?;
        file.set_len(bytes as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map.copy_from_slice(bytemuck::cast_slice(source.as_slice()));
        drop(source);
        Ok(SharedBuffer::Mapped {
            map,
            len,
            _marker: PhantomData,
        })
    }

    /// Open one shared, append-only line writer on every rank. The root
    /// creates (truncating) the file; each append takes the lock for exactly
    /// one line, so records from different ranks never interleave.
    pub fn open_shared_writer(&self, root: usize, path: &std::path::Path) -> Result<SharedWriter> {
        let writer = if self.rank == root {
            let file = File::create(path)?;
            Some(Arc::new(Mutex::new(LineWriter::new(file))))
        } else {
            None
        };
        let writer = self.broadcast(root, writer);
        Ok(SharedWriter { writer })
    }

    fn deposit<T: Send + Sync + 'static>(&self, value: T) {
        {
            let mut slots = self.shared.slots.write().unwrap();
            slots[self.rank] = Some(Box::new(value));
        }
        self.barrier();
    }

    fn clear_slots(&self) {
        self.barrier();
        if self.rank == 0 {
            let mut slots = self.shared.slots.write().unwrap();
            for slot in slots.iter_mut() {
                *slot = None;
            }
        }
        self.barrier();
    }
}

/// Result of a size-tiered broadcast: either an owned vector or a view over
/// a per-rank memory-mapped temporary.
pub enum SharedBuffer<T> {
    Owned(Vec<T>),
    Mapped {
        map: MmapMut,
        len: usize,
        _marker: PhantomData<T>,
    },
}

impl<T: Pod> SharedBuffer<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            SharedBuffer::Owned(v) => v,
            SharedBuffer::Mapped { map, len, .. } => {
                &bytemuck::cast_slice(&map[..])[..*len]
            }
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            SharedBuffer::Owned(v) => v,
            SharedBuffer::Mapped { map, len, .. } => {
                bytemuck::cast_slice(&map[..])[..len].to_vec()
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SharedBuffer::Owned(v) => v.len(),
            SharedBuffer::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Pod> Deref for SharedBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

/// Mutex-guarded append-only writer shared by every rank.
#[derive(Clone)]
pub struct SharedWriter {
    writer: Arc<Mutex<LineWriter<File>>>,
}

impl SharedWriter {
    pub fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().unwrap();
        guard.write_all(line.as_bytes())?;
        Ok(())
    }
}
