use std::any::Any;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::error::{LabelError, LabelResult};

/// Contiguous slice of an ordered index handed to one worker as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Molecule {
    pub id: usize,
    pub range: Range<usize>,
}

impl Molecule {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// View the molecule's rows of an index-aligned sequence.
    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        &items[self.range.clone()]
    }

    pub fn positions(&self) -> Range<usize> {
        self.range.clone()
    }
}

/// Split `0..len` into `batches` contiguous molecules of `len / batches`
/// rows; the last molecule absorbs the remainder. The batch count is capped
/// at `len` so no molecule is ever empty.
pub fn partition(len: usize, batches: usize) -> Vec<Molecule> {
    if len == 0 {
        return Vec::new();
    }
    let batches = batches.clamp(1, len);
    let base = len / batches;
    (0..batches)
        .map(|id| {
            let start = id * base;
            let end = if id + 1 == batches { len } else { start + base };
            Molecule {
                id,
                range: start..end,
            }
        })
        .collect()
}

/// Fixed-size worker pool exposing a single primitive: map a pure function
/// over ordered molecules and concatenate the outputs in molecule order.
///
/// Workers only see shared borrows of their inputs. A failing or panicking
/// molecule aborts the whole call and no partial output is returned. Errors
/// returned by the mapped function keep their kind; panics become
/// [`LabelError::WorkerFailure`].
pub struct ParallelExecutor {
    workers: usize,
    batch_multiplier: usize,
    pool: ThreadPool,
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("workers", &self.workers)
            .field("batch_multiplier", &self.batch_multiplier)
            .finish()
    }
}

impl ParallelExecutor {
    pub fn new(workers: usize, batch_multiplier: usize) -> LabelResult<Self> {
        if workers == 0 {
            return Err(LabelError::config("worker count must be >= 1"));
        }
        if batch_multiplier == 0 {
            return Err(LabelError::config("batch multiplier must be >= 1"));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("labelsmith-worker-{idx}"))
            .build()
            .map_err(|err| LabelError::config(format!("failed to build worker pool: {err}")))?;
        Ok(Self {
            workers,
            batch_multiplier,
            pool,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn batch_multiplier(&self) -> usize {
        self.batch_multiplier
    }

    pub fn batch_count(&self) -> usize {
        self.workers.saturating_mul(self.batch_multiplier)
    }

    pub fn molecules(&self, len: usize) -> Vec<Molecule> {
        partition(len, self.batch_count())
    }

    /// Run `f` once per molecule of `0..len` and concatenate the outputs in
    /// molecule order. A single molecule runs directly on the calling thread.
    pub fn map_molecules<R, F>(&self, len: usize, f: F) -> LabelResult<Vec<R>>
    where
        R: Send,
        F: Fn(&Molecule) -> LabelResult<Vec<R>> + Sync,
    {
        let molecules = self.molecules(len);
        let start = Instant::now();
        let parts = match molecules.as_slice() {
            [] => return Ok(Vec::new()),
            [only] => vec![run_molecule(only, &f)?],
            _ => self.pool.install(|| {
                molecules
                    .par_iter()
                    .map(|molecule| run_molecule(molecule, &f))
                    .collect::<LabelResult<Vec<_>>>()
            })?,
        };
        debug!(
            rows = len,
            molecules = molecules.len(),
            workers = self.workers,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "molecules merged"
        );
        Ok(parts.into_iter().flatten().collect())
    }

    /// Like [`map_molecules`](Self::map_molecules) but every molecule must
    /// return exactly one output per index position, so the merged result is
    /// index-complete and aligned with `0..len`.
    pub fn map_indexed<R, F>(&self, len: usize, f: F) -> LabelResult<Vec<R>>
    where
        R: Send,
        F: Fn(&Molecule) -> LabelResult<Vec<R>> + Sync,
    {
        self.map_molecules(len, |molecule| {
            let out = f(molecule)?;
            if out.len() != molecule.len() {
                return Err(LabelError::WorkerFailure {
                    molecule: molecule.id,
                    reason: format!(
                        "expected {} outputs for rows {:?}, got {}",
                        molecule.len(),
                        molecule.range,
                        out.len()
                    ),
                });
            }
            Ok(out)
        })
    }
}

fn run_molecule<R, F>(molecule: &Molecule, f: &F) -> LabelResult<Vec<R>>
where
    F: Fn(&Molecule) -> LabelResult<Vec<R>>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| f(molecule))) {
        Ok(Ok(out)) => Ok(out),
        Ok(Err(err)) => {
            debug!(molecule = molecule.id, error = %err, "molecule failed");
            Err(err)
        }
        Err(payload) => Err(LabelError::WorkerFailure {
            molecule: molecule.id,
            reason: format!("worker panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
