//! Message passing between cooperating processes.
//!
//! Every distributed vector has an owned range per process and an overlapped (ghosted) range
//! that also contains the entries needed by the process' elements. [`PartitionMap::gather`]
//! copies owned values into overlapped copies, [`PartitionMap::scatter_add`] accumulates
//! overlapped contributions into the owners. Owned entries are only ever written by their owner.
//!
//! All operations here are blocking collectives: every process must call them in the same
//! order.
use mscale_sparse::{CooMatrix, CsrMatrix, LinearSolveError, LinearSolver};
use nalgebra::DVector;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};

/// Data sent from one process to another in a single exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Reals(Vec<f64>),
    Indices(Vec<usize>),
    Entries(Vec<(usize, f64)>),
    Triplets(Vec<(usize, usize, f64)>),
    Failure(LinearSolveError),
}

impl Payload {
    pub fn empty() -> Self {
        Payload::Indices(Vec::new())
    }

    pub fn into_reals(self) -> Vec<f64> {
        match self {
            Payload::Reals(values) => values,
            other => panic!("expected real values, got {:?}", other),
        }
    }

    pub fn into_indices(self) -> Vec<usize> {
        match self {
            Payload::Indices(indices) => indices,
            other => panic!("expected indices, got {:?}", other),
        }
    }

    pub fn into_entries(self) -> Vec<(usize, f64)> {
        match self {
            Payload::Entries(entries) => entries,
            Payload::Indices(indices) if indices.is_empty() => Vec::new(),
            other => panic!("expected entries, got {:?}", other),
        }
    }

    pub fn into_triplets(self) -> Vec<(usize, usize, f64)> {
        match self {
            Payload::Triplets(triplets) => triplets,
            Payload::Indices(indices) if indices.is_empty() => Vec::new(),
            other => panic!("expected triplets, got {:?}", other),
        }
    }
}

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sends `outgoing[r]` to rank `r` and returns the payloads received, indexed by source.
    fn exchange(&self, outgoing: Vec<Payload>) -> Vec<Payload>;

    /// A communicator containing only this process.
    fn split_self(&self) -> Box<dyn Communicator>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Element-wise sum over all processes. Contributions are added in rank order, so every
    /// process obtains bitwise identical results.
    fn sum_all(&self, values: &mut [f64]) {
        let received = self.exchange(vec![Payload::Reals(values.to_vec()); self.size()]);
        values.iter_mut().for_each(|v| *v = 0.0);
        for contribution in received {
            let contribution = contribution.into_reals();
            assert_eq!(contribution.len(), values.len(), "mismatched reduction lengths");
            for (v, c) in values.iter_mut().zip(contribution) {
                *v += c;
            }
        }
    }

    fn max_all(&self, values: &mut [f64]) {
        let received = self.exchange(vec![Payload::Reals(values.to_vec()); self.size()]);
        for contribution in received {
            for (v, c) in values.iter_mut().zip(contribution.into_reals()) {
                *v = v.max(c);
            }
        }
    }

    fn min_all(&self, values: &mut [f64]) {
        let received = self.exchange(vec![Payload::Reals(values.to_vec()); self.size()]);
        for contribution in received {
            for (v, c) in values.iter_mut().zip(contribution.into_reals()) {
                *v = v.min(c);
            }
        }
    }

    fn min_all_indices(&self, values: &mut [usize]) {
        let received = self.exchange(vec![Payload::Indices(values.to_vec()); self.size()]);
        for contribution in received {
            for (v, c) in values.iter_mut().zip(contribution.into_indices()) {
                *v = (*v).min(c);
            }
        }
    }

    /// Whether any process reports `true`.
    fn any(&self, flag: bool) -> bool {
        let mut value = [if flag { 1.0 } else { 0.0 }];
        self.max_all(&mut value);
        value[0] > 0.0
    }

    fn barrier(&self) {
        self.exchange(vec![Payload::empty(); self.size()]);
    }
}

/// Single-process communicator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange(&self, outgoing: Vec<Payload>) -> Vec<Payload> {
        assert_eq!(outgoing.len(), 1);
        outgoing
    }

    fn split_self(&self) -> Box<dyn Communicator> {
        Box::new(SerialCommunicator)
    }
}

#[derive(Debug)]
struct Envelope {
    source: usize,
    epoch: u64,
    payload: Payload,
}

/// A process of a [`LocalCluster`], backed by in-memory channels.
#[derive(Debug)]
pub struct ThreadCommunicator {
    rank: usize,
    size: usize,
    senders: Mutex<Vec<Sender<Envelope>>>,
    receiver: Mutex<Receiver<Envelope>>,
    /// Messages that arrived early for a later exchange.
    pending: Mutex<Vec<Envelope>>,
    epoch: AtomicU64,
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn exchange(&self, outgoing: Vec<Payload>) -> Vec<Payload> {
        assert_eq!(outgoing.len(), self.size);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);

        {
            let senders = self.senders.lock();
            for (destination, payload) in outgoing.into_iter().enumerate() {
                let envelope = Envelope {
                    source: self.rank,
                    epoch,
                    payload,
                };
                if senders[destination].send(envelope).is_err() {
                    panic!("rank {} hung up during exchange {}", destination, epoch);
                }
            }
        }

        let mut received: Vec<Option<Payload>> = (0..self.size).map(|_| None).collect();
        let mut remaining = self.size;
        {
            let mut pending = self.pending.lock();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].epoch == epoch {
                    let envelope = pending.swap_remove(i);
                    received[envelope.source] = Some(envelope.payload);
                    remaining -= 1;
                } else {
                    i += 1;
                }
            }
        }

        let receiver = self.receiver.lock();
        while remaining > 0 {
            let envelope = receiver
                .recv()
                .unwrap_or_else(|_| panic!("rank {} lost its peers during exchange {}", self.rank, epoch));
            if envelope.epoch == epoch {
                received[envelope.source] = Some(envelope.payload);
                remaining -= 1;
            } else {
                self.pending.lock().push(envelope);
            }
        }

        received
            .into_iter()
            .map(|payload| payload.unwrap_or_else(|| panic!("incomplete exchange {}", epoch)))
            .collect()
    }

    fn split_self(&self) -> Box<dyn Communicator> {
        Box::new(SerialCommunicator)
    }
}

/// Runs several processes as threads of the current process.
pub struct LocalCluster;

impl LocalCluster {
    pub fn communicators(size: usize) -> Vec<ThreadCommunicator> {
        assert!(size > 0);
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| channel()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ThreadCommunicator {
                rank,
                size,
                senders: Mutex::new(senders.clone()),
                receiver: Mutex::new(receiver),
                pending: Mutex::new(Vec::new()),
                epoch: AtomicU64::new(0),
            })
            .collect()
    }

    /// Runs `f` once per rank on its own thread and returns the results in rank order.
    ///
    /// A panic on any rank is propagated to the caller.
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(ThreadCommunicator) -> R + Send + Sync,
        R: Send,
    {
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = Self::communicators(size)
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|err| std::panic::resume_unwind(err)))
                .collect()
        })
    }
}

/// Owned and overlapped index sets of a distributed vector.
#[derive(Debug, Clone)]
pub struct PartitionMap {
    global_len: usize,
    owned: Vec<usize>,
    overlapped: Vec<usize>,
    owned_lid: FxHashMap<usize, usize>,
    overlapped_lid: FxHashMap<usize, usize>,
    /// Owned gids that each rank holds a ghost copy of.
    export: Vec<Vec<usize>>,
    /// Ghost gids owned by each rank.
    import: Vec<Vec<usize>>,
}

impl PartitionMap {
    /// Builds the map from the gids each process touches.
    ///
    /// Each gid is owned by the lowest rank that touches it. Gids touched by nobody go to
    /// rank 0.
    pub fn new(comm: &dyn Communicator, touched: impl IntoIterator<Item = usize>, global_len: usize) -> Self {
        let rank = comm.rank();
        let size = comm.size();

        let mut overlapped: Vec<usize> = touched.into_iter().collect();
        overlapped.sort_unstable();
        overlapped.dedup();
        assert!(overlapped.last().map(|&gid| gid < global_len).unwrap_or(true));

        let mut owner = vec![usize::MAX; global_len];
        for &gid in &overlapped {
            owner[gid] = rank;
        }
        comm.min_all_indices(&mut owner);
        for o in owner.iter_mut().filter(|o| **o == usize::MAX) {
            *o = 0;
        }
        if rank == 0 {
            let orphans: Vec<usize> = owner
                .iter()
                .enumerate()
                .filter(|&(gid, &o)| o == 0 && overlapped.binary_search(&gid).is_err())
                .map(|(gid, _)| gid)
                .collect();
            overlapped.extend(orphans);
            overlapped.sort_unstable();
        }

        let owned: Vec<usize> = overlapped.iter().copied().filter(|&gid| owner[gid] == rank).collect();
        let mut import = vec![Vec::new(); size];
        for &gid in &overlapped {
            if owner[gid] != rank {
                import[owner[gid]].push(gid);
            }
        }
        let export = comm
            .exchange(import.iter().cloned().map(Payload::Indices).collect())
            .into_iter()
            .map(Payload::into_indices)
            .collect();

        let owned_lid = owned.iter().enumerate().map(|(lid, &gid)| (gid, lid)).collect();
        let overlapped_lid = overlapped.iter().enumerate().map(|(lid, &gid)| (gid, lid)).collect();

        Self {
            global_len,
            owned,
            overlapped,
            owned_lid,
            overlapped_lid,
            export,
            import,
        }
    }

    pub fn global_len(&self) -> usize {
        self.global_len
    }

    pub fn owned(&self) -> &[usize] {
        &self.owned
    }

    pub fn overlapped(&self) -> &[usize] {
        &self.overlapped
    }

    pub fn owned_lid(&self, gid: usize) -> Option<usize> {
        self.owned_lid.get(&gid).copied()
    }

    pub fn overlapped_lid(&self, gid: usize) -> Option<usize> {
        self.overlapped_lid.get(&gid).copied()
    }

    pub fn is_owned(&self, gid: usize) -> bool {
        self.owned_lid.contains_key(&gid)
    }

    /// Owned to overlapped.
    pub fn gather(&self, comm: &dyn Communicator, owned: &DVector<f64>) -> DVector<f64> {
        assert_eq!(owned.len(), self.owned.len());
        let outgoing = self
            .export
            .iter()
            .map(|gids| Payload::Reals(gids.iter().map(|gid| owned[self.owned_lid[gid]]).collect()))
            .collect();
        let incoming = comm.exchange(outgoing);

        let mut overlapped = DVector::zeros(self.overlapped.len());
        for (lid, gid) in self.owned.iter().enumerate() {
            overlapped[self.overlapped_lid[gid]] = owned[lid];
        }
        for (gids, payload) in self.import.iter().zip(incoming) {
            for (gid, value) in gids.iter().zip(payload.into_reals()) {
                overlapped[self.overlapped_lid[gid]] = value;
            }
        }
        overlapped
    }

    /// Overlapped to owned, summing the contributions of all processes.
    pub fn scatter_add(&self, comm: &dyn Communicator, overlapped: &DVector<f64>) -> DVector<f64> {
        assert_eq!(overlapped.len(), self.overlapped.len());
        let outgoing = self
            .import
            .iter()
            .map(|gids| Payload::Reals(gids.iter().map(|gid| overlapped[self.overlapped_lid[gid]]).collect()))
            .collect();
        let incoming = comm.exchange(outgoing);

        let mut owned = DVector::zeros(self.owned.len());
        for (lid, gid) in self.owned.iter().enumerate() {
            owned[lid] = overlapped[self.overlapped_lid[gid]];
        }
        for (gids, payload) in self.export.iter().zip(incoming) {
            for (gid, value) in gids.iter().zip(payload.into_reals()) {
                owned[self.owned_lid[gid]] += value;
            }
        }
        owned
    }

    /// Assembles the full global vector on every process.
    pub fn all_gather(&self, comm: &dyn Communicator, owned: &DVector<f64>) -> DVector<f64> {
        let entries: Vec<(usize, f64)> = self.owned.iter().copied().zip(owned.iter().copied()).collect();
        let incoming = comm.exchange(vec![Payload::Entries(entries); comm.size()]);
        let mut global = DVector::zeros(self.global_len);
        for payload in incoming {
            for (gid, value) in payload.into_entries() {
                global[gid] = value;
            }
        }
        global
    }

    /// Extracts the owned part of a global vector.
    pub fn restrict(&self, global: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(self.owned.len(), self.owned.iter().map(|&gid| global[gid]))
    }
}

/// Solves a linear system whose rows are distributed over the processes by sending everything
/// to rank 0.
///
/// `triplets` may contain entries for any row; duplicates are summed. `rhs` is the owned part
/// of the right-hand side. `modify` runs on rank 0 only, on the assembled triplets and global
/// right-hand side, before the matrix is built. Returns the owned part of the solution.
pub fn solve_on_root(
    comm: &dyn Communicator,
    map: &PartitionMap,
    triplets: Vec<(usize, usize, f64)>,
    rhs: &DVector<f64>,
    solver: &mut dyn LinearSolver<f64>,
    transpose: bool,
    modify: impl FnOnce(&mut Vec<(usize, usize, f64)>, &mut DVector<f64>),
) -> Result<DVector<f64>, LinearSolveError> {
    let size = comm.size();
    let to_root = |payload: Payload| {
        let mut outgoing = vec![Payload::empty(); size];
        outgoing[0] = payload;
        outgoing
    };

    let all_triplets = comm.exchange(to_root(Payload::Triplets(triplets)));
    let rhs_entries: Vec<(usize, f64)> = map.owned().iter().copied().zip(rhs.iter().copied()).collect();
    let all_rhs = comm.exchange(to_root(Payload::Entries(rhs_entries)));

    let replies = if comm.is_root() {
        let n = map.global_len();
        let mut triplets: Vec<_> = all_triplets.into_iter().flat_map(Payload::into_triplets).collect();
        let owned_by_rank: Vec<Vec<(usize, f64)>> = all_rhs.into_iter().map(Payload::into_entries).collect();
        let mut b = DVector::zeros(n);
        for &(gid, value) in owned_by_rank.iter().flatten() {
            b[gid] = value;
        }
        modify(&mut triplets, &mut b);

        let mut coo = CooMatrix::new(n, n);
        for (i, j, v) in triplets {
            coo.push(i, j, v);
        }
        let a = CsrMatrix::from(&coo);
        let result = if transpose {
            solver.solve_transpose(&a, &b)
        } else {
            solver.solve(&a, &b)
        };
        match result {
            Ok(x) => owned_by_rank
                .iter()
                .map(|entries| Payload::Reals(entries.iter().map(|(gid, _)| x[*gid]).collect()))
                .collect(),
            Err(err) => vec![Payload::Failure(err); size],
        }
    } else {
        vec![Payload::empty(); size]
    };

    match comm.exchange(replies).swap_remove(0) {
        Payload::Failure(err) => Err(err),
        payload => Ok(DVector::from_vec(payload.into_reals())),
    }
}
