use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::Arc;

use anyhow::{self, ensure, format_err};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Zip};

use crate::civec::{Civec, SubspaceVector};
use crate::determinant::Determinants;
use crate::parallel::{CommHandle, StaticDist};

/// A CI vector whose alpha-string rows are sharded over the ranks of a communicator.
///
/// Each rank stores only the rows it owns. Writes into rows owned by other ranks are buffered
/// sparsely by [`DistCivec::accumulate_bstring_buf`] and shipped to their owners by
/// [`DistCivec::flush`]; remote rows are read with [`DistCivec::fetch_rows`].
#[derive(Clone, Debug)]
pub struct DistCivec {
    det: Arc<Determinants>,
    comm: CommHandle,
    dist: StaticDist,

    /// The locally owned rows.
    local: Array2<f64>,

    /// Pending contributions to rows owned elsewhere, keyed by alpha string.
    pending: BTreeMap<usize, Array1<f64>>,
}

impl DistCivec {
    /// Creates a zero vector distributed over `comm`.
    pub fn zeros(det: Arc<Determinants>, comm: CommHandle) -> Self {
        let dist = StaticDist::new(det.lena(), comm.size());
        let range = dist.range(comm.rank());
        let local = Array2::zeros((range.len(), det.lenb()));
        Self {
            det,
            comm,
            dist,
            local,
            pending: BTreeMap::new(),
        }
    }

    /// Distributes a replicated vector, keeping only the locally owned rows.
    pub fn from_civec(cc: &Civec, comm: CommHandle) -> Self {
        let mut out = Self::zeros(cc.det().clone(), comm);
        let range = out.local_range();
        out.local.assign(&cc.data().slice(s![range, ..]));
        out
    }

    /// Gathers the full vector on every rank. Collective.
    pub fn to_civec(&self) -> Result<Civec, anyhow::Error> {
        let mut full = Array2::<f64>::zeros((self.det.lena(), self.det.lenb()));
        full.slice_mut(s![self.local_range(), ..])
            .assign(&self.local);
        let buf = full
            .as_slice_mut()
            .ok_or_else(|| format_err!("Gather buffer is not contiguous."))?;
        self.comm.allreduce_sum(buf)?;
        Civec::from_array(self.det.clone(), full)
    }

    /// The determinant space.
    pub fn det(&self) -> &Arc<Determinants> {
        &self.det
    }

    /// The communicator.
    pub fn comm(&self) -> &CommHandle {
        &self.comm
    }

    /// The distribution of alpha strings over ranks.
    pub fn dist(&self) -> &StaticDist {
        &self.dist
    }

    /// The alpha strings owned by this rank.
    pub fn local_range(&self) -> Range<usize> {
        self.dist.range(self.comm.rank())
    }

    /// Returns `true` if alpha string `ia` is owned by this rank.
    pub fn is_local(&self, ia: usize) -> bool {
        self.local_range().contains(&ia)
    }

    /// The locally owned rows.
    pub fn local(&self) -> ArrayView2<'_, f64> {
        self.local.view()
    }

    /// Mutable access to the locally owned rows.
    pub fn local_mut(&mut self) -> ArrayViewMut2<'_, f64> {
        self.local.view_mut()
    }

    /// The number of remote rows with buffered contributions.
    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    /// The locally owned row of alpha string `ia`.
    pub fn local_row(&self, ia: usize) -> Result<ArrayView1<'_, f64>, anyhow::Error> {
        let range = self.local_range();
        ensure!(range.contains(&ia), "Alpha string {ia} is not owned by this rank.");
        Ok(self.local.row(ia - range.start))
    }

    fn local_row_mut(&mut self, ia: usize) -> Result<ArrayViewMut1<'_, f64>, anyhow::Error> {
        let range = self.local_range();
        ensure!(range.contains(&ia), "Alpha string {ia} is not owned by this rank.");
        Ok(self.local.row_mut(ia - range.start))
    }

    /// Adds `buf` into the row of alpha string `ia`. Rows owned by another rank are buffered
    /// until the next [`Self::flush`].
    pub fn accumulate_bstring_buf(
        &mut self,
        buf: ArrayView1<'_, f64>,
        ia: usize,
    ) -> Result<(), anyhow::Error> {
        ensure!(
            buf.len() == self.det.lenb(),
            "Beta-string buffer of length {} does not match {} beta strings.",
            buf.len(),
            self.det.lenb()
        );
        ensure!(
            ia < self.det.lena(),
            "Alpha string {ia} is out of range for {} alpha strings.",
            self.det.lena()
        );
        if self.is_local(ia) {
            let mut row = self.local_row_mut(ia)?;
            row += &buf;
            return Ok(());
        }
        let lenb = self.det.lenb();
        let row = self
            .pending
            .entry(ia)
            .or_insert_with(|| Array1::zeros(lenb));
        *row += &buf;
        Ok(())
    }

    /// Ships all buffered remote contributions to their owning ranks and adds them there.
    /// Collective.
    pub fn flush(&mut self) -> Result<(), anyhow::Error> {
        let nranks = self.comm.size();
        let lenb = self.det.lenb();
        let mut indices = vec![Vec::<u64>::new(); nranks];
        let mut values = vec![Vec::<f64>::new(); nranks];
        for (ia, row) in std::mem::take(&mut self.pending) {
            let owner = self.dist.owner(ia);
            indices[owner].push(ia as u64);
            values[owner].extend(row.iter());
        }
        let indices = self.comm.all_to_all_u64(&indices)?;
        let values = self.comm.all_to_all_f64(&values)?;
        for (rows, buf) in indices.iter().zip(values.iter()) {
            ensure!(
                buf.len() == rows.len() * lenb,
                "Received {} values for {} rows of length {lenb}.",
                buf.len(),
                rows.len()
            );
            for (&ia, chunk) in rows.iter().zip(buf.chunks_exact(lenb.max(1))) {
                let mut row = self.local_row_mut(ia as usize)?;
                row += &ArrayView1::from(chunk);
            }
        }
        Ok(())
    }

    /// Returns the rows of the alpha strings in `rows`, fetching those owned by other ranks.
    /// Collective: every rank must call this, possibly with an empty request.
    pub fn fetch_rows(&self, rows: &[usize]) -> Result<BTreeMap<usize, Array1<f64>>, anyhow::Error> {
        let nranks = self.comm.size();
        let lenb = self.det.lenb();
        let mut out = BTreeMap::new();
        let mut requests = vec![Vec::<u64>::new(); nranks];
        for ia in rows.iter().copied().collect::<BTreeSet<_>>() {
            ensure!(
                ia < self.det.lena(),
                "Alpha string {ia} is out of range for {} alpha strings.",
                self.det.lena()
            );
            if self.is_local(ia) {
                out.insert(ia, self.local_row(ia)?.to_owned());
            } else {
                requests[self.dist.owner(ia)].push(ia as u64);
            }
        }
        let incoming = self.comm.all_to_all_u64(&requests)?;
        let replies = incoming
            .iter()
            .map(|wanted| {
                wanted.iter().try_fold(
                    Vec::with_capacity(wanted.len() * lenb),
                    |mut buf, &ia| {
                        buf.extend(self.local_row(ia as usize)?.iter());
                        Ok::<_, anyhow::Error>(buf)
                    },
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let answers = self.comm.all_to_all_f64(&replies)?;
        for (wanted, buf) in requests.iter().zip(answers.iter()) {
            ensure!(
                buf.len() == wanted.len() * lenb,
                "Received {} values for {} rows of length {lenb}.",
                buf.len(),
                wanted.len()
            );
            for (&ia, chunk) in wanted.iter().zip(buf.chunks_exact(lenb.max(1))) {
                out.insert(ia as usize, Array1::from_vec(chunk.to_vec()));
            }
        }
        Ok(out)
    }

    fn check_same_layout(&self, other: &DistCivec) -> Result<(), anyhow::Error> {
        ensure!(
            self.det.is_same_space(&other.det) && self.dist == other.dist,
            "Distributed CI vectors have different layouts."
        );
        Ok(())
    }
}

impl SubspaceVector for DistCivec {
    fn dot(&self, other: &Self) -> Result<f64, anyhow::Error> {
        self.check_same_layout(other)?;
        let mut sum = [Zip::from(&self.local)
            .and(&other.local)
            .fold(0.0, |acc, a, b| acc + a * b)];
        self.comm.allreduce_sum(&mut sum)?;
        Ok(sum[0])
    }

    fn ax_plus_y(&mut self, a: f64, x: &Self) -> Result<(), anyhow::Error> {
        self.check_same_layout(x)?;
        self.local.scaled_add(a, &x.local);
        Ok(())
    }

    fn scale(&mut self, a: f64) {
        self.local.mapv_inplace(|v| v * a);
    }

    fn zero(&mut self) {
        self.local.fill(0.0);
        self.pending.clear();
    }

    fn size(&self) -> usize {
        self.det.size()
    }
}
