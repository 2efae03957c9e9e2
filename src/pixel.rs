/// Per-object pixel sample lists
///
/// `PixelList` behaves like a `Vec<PixelSample>` with two interchangeable
/// backing stores: a plain array owned by the list, or blocks drawn from the
/// process-wide `SamplePool`. The pool's free list is not reentrant, so every
/// structural change of a pooled list happens inside the pool's lock. Array
/// lists are owned by one thread at a time and need no locking.
use std::mem;
use std::ops::{Index, IndexMut};

use bumpalo::Bump;
use nalgebra::Complex;
use parking_lot::{const_mutex, Mutex, MutexGuard};

/// Fewer than 10 samples inside the aperture
pub const FLAG_LT10PIX: u32 = 0x0001;

/// Smallest block handed out by the pool
const MIN_BLOCK_CAPACITY: usize = 256;

/// Free blocks kept for reuse; larger surpluses go back to the allocator
const MAX_FREE_BLOCKS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PixelSample {
    pos: Complex<f64>,
    flux: f64,
    inverse_sigma: f64,
}

impl PixelSample {
    pub fn new(u: f64, v: f64, flux: f64, inverse_sigma: f64) -> Self {
        Self::from_position(Complex::new(u, v), flux, inverse_sigma)
    }

    pub fn from_position(pos: Complex<f64>, flux: f64, inverse_sigma: f64) -> Self {
        Self {
            pos,
            flux,
            inverse_sigma,
        }
    }

    pub fn pos(&self) -> Complex<f64> {
        self.pos
    }

    pub fn flux(&self) -> f64 {
        self.flux
    }

    pub fn inverse_sigma(&self) -> f64 {
        self.inverse_sigma
    }

    pub fn set_pos(&mut self, pos: Complex<f64>) {
        self.pos = pos;
    }

    pub fn set_flux(&mut self, flux: f64) {
        self.flux = flux;
    }

    pub fn set_inverse_sigma(&mut self, inverse_sigma: f64) {
        self.inverse_sigma = inverse_sigma;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct PoolStats {
    pub free_blocks: usize,
    pub allocated_blocks: usize,
    pub reused_blocks: usize,
}

struct PoolState {
    free: Vec<Vec<PixelSample>>,
    stats: PoolStats,
}

impl PoolState {
    /// Smallest free block that fits, or a fresh one
    fn acquire(&mut self, capacity: usize) -> Vec<PixelSample> {
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, block)| block.capacity() >= capacity)
            .min_by_key(|(_, block)| block.capacity())
            .map(|(i, _)| i);

        match best {
            Some(i) => {
                self.stats.reused_blocks += 1;
                self.stats.free_blocks -= 1;
                self.free.swap_remove(i)
            }
            None => {
                self.stats.allocated_blocks += 1;
                Vec::with_capacity(capacity.max(MIN_BLOCK_CAPACITY).next_power_of_two())
            }
        }
    }

    fn release(&mut self, mut block: Vec<PixelSample>) {
        if block.capacity() == 0 {
            return;
        }
        block.clear();
        if self.free.len() < MAX_FREE_BLOCKS {
            self.free.push(block);
            self.stats.free_blocks += 1;
        }
    }

    /// Move `buf` into a block holding at least `needed` samples
    fn ensure_capacity(&mut self, buf: &mut Vec<PixelSample>, needed: usize) {
        if needed <= buf.capacity() {
            return;
        }
        let mut block = self.acquire(needed);
        block.extend_from_slice(buf);
        let old = mem::replace(buf, block);
        self.release(old);
    }
}

/// Block pool shared by every pooled `PixelList`
pub struct SamplePool {
    state: Mutex<PoolState>,
}

static SAMPLE_POOL: SamplePool = SamplePool {
    state: const_mutex(PoolState {
        free: Vec::new(),
        stats: PoolStats {
            free_blocks: 0,
            allocated_blocks: 0,
            reused_blocks: 0,
        },
    }),
};

impl SamplePool {
    pub fn global() -> &'static SamplePool {
        &SAMPLE_POOL
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock()
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().stats
    }

    fn acquire(&self, capacity: usize) -> Vec<PixelSample> {
        self.lock().acquire(capacity)
    }

    fn release(&self, block: Vec<PixelSample>) {
        self.lock().release(block);
    }

    /// Move `buf` into a block holding at least `needed` samples
    fn ensure_capacity(&self, buf: &mut Vec<PixelSample>, needed: usize) {
        if needed > buf.capacity() {
            self.lock().ensure_capacity(buf, needed);
        }
    }

    fn resize(&self, buf: &mut Vec<PixelSample>, n: usize) {
        let mut state = self.lock();
        state.ensure_capacity(buf, n);
        buf.resize(n, PixelSample::default());
    }

    fn push(&self, buf: &mut Vec<PixelSample>, sample: PixelSample) {
        let mut state = self.lock();
        if buf.len() == buf.capacity() {
            let grown = (buf.capacity() * 2).max(MIN_BLOCK_CAPACITY);
            state.ensure_capacity(buf, grown);
        }
        buf.push(sample);
    }

    fn clear(&self, buf: &mut Vec<PixelSample>) {
        let _state = self.lock();
        buf.clear();
    }
}

#[derive(Debug)]
enum Store {
    Array(Vec<PixelSample>),
    Pooled(Vec<PixelSample>),
}

#[derive(Debug)]
pub struct PixelList {
    store: Store,
}

impl Default for PixelList {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelList {
    pub fn new() -> Self {
        Self {
            store: Store::Array(Vec::new()),
        }
    }

    pub fn with_len(n: usize) -> Self {
        Self {
            store: Store::Array(vec![PixelSample::default(); n]),
        }
    }

    /// Switch to the pooled store. Only honoured while the list is empty;
    /// later calls are ignored.
    pub fn use_pool(&mut self) {
        if self.is_pooled() {
            return;
        }
        if !self.is_empty() {
            tracing::warn!(
                "PixelList::use_pool ignored: list already holds {} samples",
                self.len()
            );
            return;
        }
        let block = SamplePool::global().acquire(MIN_BLOCK_CAPACITY);
        self.store = Store::Pooled(block);
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.store, Store::Pooled(_))
    }

    fn samples(&self) -> &Vec<PixelSample> {
        match &self.store {
            Store::Array(v) | Store::Pooled(v) => v,
        }
    }

    fn samples_mut(&mut self) -> &mut Vec<PixelSample> {
        match &mut self.store {
            Store::Array(v) | Store::Pooled(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.samples().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.samples().capacity()
    }

    /// Make room for at least `n` samples in total
    pub fn reserve(&mut self, n: usize) {
        match &mut self.store {
            Store::Array(v) => {
                if n > v.capacity() {
                    v.reserve_exact(n - v.len());
                }
            }
            Store::Pooled(v) => SamplePool::global().ensure_capacity(v, n),
        }
    }

    pub fn resize(&mut self, n: usize) {
        match &mut self.store {
            Store::Array(v) => v.resize(n, PixelSample::default()),
            Store::Pooled(v) => SamplePool::global().resize(v, n),
        }
    }

    pub fn clear(&mut self) {
        match &mut self.store {
            Store::Array(v) => v.clear(),
            Store::Pooled(v) => SamplePool::global().clear(v),
        }
    }

    pub fn push(&mut self, sample: PixelSample) {
        match &mut self.store {
            Store::Array(v) => v.push(sample),
            Store::Pooled(v) => SamplePool::global().push(v, sample),
        }
    }

    pub fn as_slice(&self) -> &[PixelSample] {
        self.samples()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PixelSample> {
        self.samples().iter()
    }

    /// Order samples by ascending squared distance from `center`
    pub fn sort(&mut self, center: Complex<f64>) {
        self.samples_mut().sort_by(|a, b| {
            (a.pos - center)
                .norm_sqr()
                .total_cmp(&(b.pos - center).norm_sqr())
        });
    }
}

impl Clone for PixelList {
    /// Copies always use the array store
    fn clone(&self) -> Self {
        Self {
            store: Store::Array(self.samples().clone()),
        }
    }
}

impl Drop for PixelList {
    fn drop(&mut self) {
        if let Store::Pooled(v) = &mut self.store {
            let block = mem::take(v);
            SamplePool::global().release(block);
        }
    }
}

impl Index<usize> for PixelList {
    type Output = PixelSample;

    fn index(&self, i: usize) -> &PixelSample {
        &self.samples()[i]
    }
}

impl IndexMut<usize> for PixelList {
    fn index_mut(&mut self, i: usize) -> &mut PixelSample {
        &mut self.samples_mut()[i]
    }
}

/// Fill `pix` with the samples of `all_pix` inside a circular aperture that
/// has been sheared by `shear`, re-centered on `cen_offset`. Returns flag bits.
pub fn sub_pixel_list(
    pix: &mut PixelList,
    all_pix: &PixelList,
    cen_offset: Complex<f64>,
    shear: Complex<f64>,
    aperture: f64,
) -> u32 {
    let n_tot = all_pix.len();
    let norm_g = shear.norm_sqr();
    let g1 = shear.re;
    let g2 = shear.im;
    let ap_sq = aperture * aperture;

    // First pass marks the samples to keep so `pix` is resized only once
    let arena = Bump::new();
    let mut should_use = bumpalo::vec![in &arena; false; n_tot];
    let mut n_pix = 0;
    for (i, sample) in all_pix.iter().enumerate() {
        let z = sample.pos() - cen_offset;
        let u_sq = z.re * z.re;
        let v_sq = z.im * z.im;
        let rsq = ((1.0 + norm_g) * (u_sq + v_sq) - 2.0 * g1 * (u_sq - v_sq)
            - 4.0 * g2 * z.re * z.im)
            / (1.0 - norm_g);
        if rsq <= ap_sq {
            should_use[i] = true;
            n_pix += 1;
        }
    }

    pix.resize(n_pix);
    let mut k = 0;
    for (i, sample) in all_pix.iter().enumerate() {
        if should_use[i] {
            let mut p = *sample;
            p.set_pos(p.pos() - cen_offset);
            pix[k] = p;
            k += 1;
        }
    }
    tracing::trace!("sub_pixel_list: {} of {} samples kept", n_pix, n_tot);

    if n_pix < 10 {
        FLAG_LT10PIX
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Push(f64),
        Resize(usize),
        Reserve(usize),
        Clear,
    }

    fn run_trace(list: &mut PixelList, ops: &[Op]) -> Vec<usize> {
        let mut sizes = Vec::new();
        for op in ops {
            match *op {
                Op::Push(v) => list.push(PixelSample::new(v, -v, v, 1.0)),
                Op::Resize(n) => list.resize(n),
                Op::Reserve(n) => list.reserve(n),
                Op::Clear => list.clear(),
            }
            sizes.push(list.len());
        }
        sizes
    }

    fn random_trace(rng: &mut StdRng, len: usize) -> Vec<Op> {
        (0..len)
            .map(|_| match rng.gen_range(0..10) {
                0 => Op::Resize(rng.gen_range(0..600)),
                1 => Op::Reserve(rng.gen_range(0..2000)),
                2 => Op::Clear,
                _ => Op::Push(rng.gen::<f64>()),
            })
            .collect()
    }

    #[test]
    fn test_backing_stores_behave_identically() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..20 {
            let ops = random_trace(&mut rng, 400);
            let mut array = PixelList::new();
            let mut pooled = PixelList::new();
            pooled.use_pool();
            assert!(pooled.is_pooled());

            assert_eq!(run_trace(&mut array, &ops), run_trace(&mut pooled, &ops));
            assert_eq!(array.as_slice(), pooled.as_slice());
            for i in 0..array.len() {
                assert_eq!(array[i], pooled[i]);
            }
        }
    }

    #[test]
    fn test_reserve_grows_capacity() {
        let mut array = PixelList::new();
        array.reserve(1000);
        assert!(array.capacity() >= 1000);
        assert_eq!(array.len(), 0);

        let mut pooled = PixelList::new();
        pooled.use_pool();
        pooled.reserve(5000);
        assert!(pooled.capacity() >= 5000);
        assert_eq!(pooled.len(), 0);
    }

    #[test]
    fn test_use_pool_after_population_is_ignored() {
        let mut list = PixelList::new();
        list.push(PixelSample::new(1.0, 2.0, 3.0, 1.0));
        list.use_pool();
        assert!(!list.is_pooled());
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].flux(), 3.0);
    }

    #[test]
    fn test_clone_uses_array_store() {
        let mut pooled = PixelList::new();
        pooled.use_pool();
        pooled.push(PixelSample::new(0.5, 0.5, 9.0, 1.0));
        let copy = pooled.clone();
        assert!(!copy.is_pooled());
        assert_eq!(copy.as_slice(), pooled.as_slice());
    }

    #[test]
    fn test_sort_by_distance() {
        let mut rng = StdRng::seed_from_u64(3);
        let center = Complex::new(1.5, -0.5);
        for pooled in [false, true] {
            let mut list = PixelList::new();
            if pooled {
                list.use_pool();
            }
            for _ in 0..500 {
                let u = rng.gen_range(-10.0..10.0);
                let v = rng.gen_range(-10.0..10.0);
                list.push(PixelSample::new(u, v, 1.0, 1.0));
            }
            list.sort(center);
            let distances: Vec<f64> = list
                .iter()
                .map(|p| (p.pos() - center).norm_sqr())
                .collect();
            assert!(distances.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(list.len(), 500);
        }
    }

    #[test]
    fn test_pool_unlocked_between_list_operations() {
        let pool = SamplePool::global();
        let unlocked = || {
            pool.state
                .try_lock_for(std::time::Duration::from_secs(5))
                .is_some()
        };
        let mut list = PixelList::new();
        list.use_pool();
        assert!(unlocked());
        for i in 0..300 {
            list.push(PixelSample::new(i as f64, 0.0, 1.0, 1.0));
        }
        assert!(unlocked());
        list.reserve(3000);
        assert!(unlocked());
        list.resize(1200);
        assert!(unlocked());
        list.clear();
        assert!(unlocked());
        drop(list);
        assert!(unlocked());
    }

    #[test]
    fn test_ensure_capacity_keeps_samples() {
        let pool = SamplePool::global();
        let mut buf = pool.acquire(4);
        buf.push(PixelSample::new(1.0, 2.0, 3.0, 0.5));
        let capacity = buf.capacity();
        pool.ensure_capacity(&mut buf, capacity);
        assert_eq!(buf.capacity(), capacity);

        pool.ensure_capacity(&mut buf, capacity + 1);
        assert!(buf.capacity() > capacity);
        assert_eq!(buf, vec![PixelSample::new(1.0, 2.0, 3.0, 0.5)]);
        pool.release(buf);
    }

    #[test]
    fn test_pooled_lists_across_threads() {
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    scope.spawn(move || {
                        let mut total = 0;
                        for round in 0..50 {
                            let mut list = PixelList::new();
                            list.use_pool();
                            let n = 100 + t * 37 + round;
                            for i in 0..n {
                                list.push(PixelSample::new(i as f64, 0.0, 1.0, 1.0));
                            }
                            assert_eq!(list.len(), n);
                            assert_eq!(list[n - 1].pos().re, (n - 1) as f64);
                            total += list.len();
                        }
                        total
                    })
                })
                .collect();
            for (t, handle) in handles.into_iter().enumerate() {
                let expected: usize = (0..50).map(|round| 100 + t * 37 + round).sum();
                assert_eq!(handle.join().unwrap(), expected);
            }
        });

        let stats = SamplePool::global().stats();
        assert!(stats.free_blocks <= MAX_FREE_BLOCKS);
        assert!(stats.allocated_blocks > 0);
    }

    #[test]
    fn test_sub_pixel_list_circular_aperture() {
        let mut all = PixelList::new();
        for j in -5..=5 {
            for i in -5..=5 {
                all.push(PixelSample::new(i as f64, j as f64, 1.0, 1.0));
            }
        }

        let mut pix = PixelList::new();
        let origin = Complex::new(0.0, 0.0);
        let flags = sub_pixel_list(&mut pix, &all, origin, origin, 2.0);
        // Lattice points with i^2 + j^2 <= 4
        assert_eq!(pix.len(), 13);
        assert_eq!(flags, 0);
        assert!(pix.iter().all(|p| p.pos().norm_sqr() <= 4.0));
    }

    #[test]
    fn test_sub_pixel_list_recenters_and_flags() {
        let mut all = PixelList::new();
        for i in 0..20 {
            all.push(PixelSample::new(10.0 + i as f64 * 0.1, 3.0, i as f64, 1.0));
        }
        let mut pix = PixelList::new();
        pix.use_pool();
        let flags = sub_pixel_list(
            &mut pix,
            &all,
            Complex::new(10.0, 3.0),
            Complex::new(0.0, 0.0),
            0.45,
        );
        assert_eq!(pix.len(), 5);
        assert_eq!(flags & FLAG_LT10PIX, FLAG_LT10PIX);
        assert!((pix[4].pos().re - 0.4).abs() < 1e-12);
        assert_eq!(pix[4].pos().im, 0.0);
    }

    #[test]
    fn test_sub_pixel_list_shear_elongates() {
        let mut all = PixelList::new();
        all.push(PixelSample::new(1.2, 0.0, 1.0, 1.0));
        all.push(PixelSample::new(0.0, 1.2, 1.0, 1.0));
        let mut pix = PixelList::new();
        // g1 > 0 stretches the aperture along u and squeezes it along v
        sub_pixel_list(&mut pix, &all, Complex::new(0.0, 0.0), Complex::new(0.3, 0.0), 1.0);
        assert_eq!(pix.len(), 1);
        assert_eq!(pix[0].pos().re, 1.2);
    }
}
