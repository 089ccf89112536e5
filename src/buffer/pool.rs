//! Cache of compositor buffers keyed by decoder frame identity.
//!
//! Decoders cycle through a small, fixed set of surfaces, so after warm-up
//! every frame is a cache hit and no import happens. The pool never evicts on
//! its own: entries go away on [`BufferPool::clear`] or when the pool drops.

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::DmabufAllocator;
use crate::error::{ImportError, PoolError};
use crate::format::{FormatCatalog, FourCc};
use crate::hwdec::{FrameIdentity, HwdecBackend, VideoFrame};

#[derive(Debug)]
pub struct PoolEntry<B> {
    pub identity: FrameIdentity,
    pub format: FourCc,
    pub buffer: B,
}

/// Clears the pool for a fixed number of display cycles after a seek.
#[derive(Debug, Clone, Copy)]
pub struct ResetWindow {
    length: u32,
    active: bool,
    cycles: u32,
}

impl ResetWindow {
    pub fn new(length: u32) -> Self {
        Self {
            length,
            active: false,
            cycles: 0,
        }
    }

    pub fn request(&mut self) {
        self.active = true;
        self.cycles = 0;
    }

    /// Advances one display cycle and reports whether it must clear.
    pub fn advance(&mut self) -> bool {
        self.cycles = self.cycles.saturating_add(1);
        if !self.active {
            return false;
        }
        if self.cycles >= self.length {
            self.active = false;
        }
        self.cycles <= self.length
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

pub struct BufferPool<A: DmabufAllocator> {
    allocator: A,
    backend: Option<HwdecBackend>,
    entries: SmallVec<[PoolEntry<A::Buffer>; 4]>,
    reset: ResetWindow,
}

impl<A: DmabufAllocator> BufferPool<A> {
    pub fn new(allocator: A, reset_window: u32) -> Self {
        Self {
            allocator,
            backend: None,
            entries: SmallVec::new(),
            reset: ResetWindow::new(reset_window),
        }
    }

    pub fn bind(&mut self, backend: HwdecBackend) -> Result<(), PoolError> {
        if let Some(current) = &self.backend {
            if !self.entries.is_empty() {
                return Err(PoolError::AlreadyBound(current.name()));
            }
        }
        debug!(backend = backend.name(), "buffer pool bound");
        self.backend = Some(backend);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend(&self) -> Option<&HwdecBackend> {
        self.backend.as_ref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the cached entry for the frame, importing it on first sight.
    pub fn get_entry(
        &mut self,
        frame: &VideoFrame,
        catalog: &FormatCatalog,
    ) -> Option<&PoolEntry<A::Buffer>> {
        profiling::scope!("BufferPool::get_entry");
        match self.lookup_or_import(frame, catalog) {
            Ok(index) => self.entries.get(index),
            Err(err) => {
                warn!("failed to import frame: {err}");
                None
            }
        }
    }

    fn lookup_or_import(
        &mut self,
        frame: &VideoFrame,
        catalog: &FormatCatalog,
    ) -> Result<usize, ImportError> {
        let backend = self.backend.as_ref().ok_or(ImportError::NoBackend)?;
        let identity = backend.identity(frame)?;
        if let Some(index) = self.entries.iter().position(|e| e.identity == identity) {
            trace!(identity = identity.0, "buffer pool hit");
            return Ok(index);
        }

        let desc = backend.import(frame, catalog)?;
        let format = FourCc(desc.format);
        let modifier = desc.modifier().ok_or(ImportError::NoPlanes)?;
        if !catalog.supports(desc.format, modifier) {
            return Err(ImportError::Unsupported { format, modifier });
        }

        let buffer = self.allocator.create_buffer(&desc)?;
        drop(desc);
        debug!(
            identity = identity.0,
            %format,
            entries = self.entries.len() + 1,
            "imported frame into buffer pool"
        );
        self.entries.push(PoolEntry {
            identity,
            format,
            buffer,
        });
        Ok(self.entries.len() - 1)
    }

    pub fn clear(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        trace!(entries = self.entries.len(), "clearing buffer pool");
        for entry in self.entries.drain(..) {
            self.allocator.destroy_buffer(entry.buffer);
        }
    }

    pub fn free(self) {
        drop(self);
    }

    pub fn request_reset(&mut self) {
        self.reset.request();
    }

    pub fn reset_pending(&self) -> bool {
        self.reset.is_active()
    }

    /// Called once per displayed frame before the lookup.
    pub fn begin_cycle(&mut self) {
        if self.reset.advance() {
            self.clear();
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }
}

impl<A: DmabufAllocator> Drop for BufferPool<A> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwdec::test_util::{memfd, open_fd_count};
    use crate::hwdec::{
        DmabufDescription, DrmFrameDescriptor, DrmLayer, DrmObject, DrmPlane, FramePayload,
    };
    use serial_test::serial;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    const NV12: FourCc = FourCc::from_chars(b"NV12");
    const P010: FourCc = FourCc::from_chars(b"P010");

    #[derive(Default)]
    struct Counters {
        created: usize,
        destroyed: usize,
    }

    struct MockAllocator {
        counters: Rc<RefCell<Counters>>,
        fail: bool,
        next: u32,
    }

    impl MockAllocator {
        fn new(fail: bool) -> (Self, Rc<RefCell<Counters>>) {
            let counters = Rc::new(RefCell::new(Counters::default()));
            (
                Self {
                    counters: counters.clone(),
                    fail,
                    next: 0,
                },
                counters,
            )
        }
    }

    impl DmabufAllocator for MockAllocator {
        type Buffer = u32;

        fn create_buffer(&mut self, _: &DmabufDescription) -> Result<u32, ImportError> {
            if self.fail {
                return Err(ImportError::BufferCreation("mock refused".into()));
            }
            self.counters.borrow_mut().created += 1;
            self.next += 1;
            Ok(self.next)
        }

        fn destroy_buffer(&mut self, _: u32) {
            self.counters.borrow_mut().destroyed += 1;
        }
    }

    fn frame(format: FourCc) -> VideoFrame {
        VideoFrame {
            width: 64,
            height: 32,
            payload: FramePayload::DrmPrime(Arc::new(DrmFrameDescriptor {
                objects: vec![DrmObject {
                    fd: memfd("frame"),
                    size: 64,
                    format_modifier: 0,
                }],
                layers: vec![DrmLayer {
                    format: format.0,
                    planes: vec![DrmPlane {
                        object_index: 0,
                        offset: 0,
                        pitch: 64,
                    }],
                }],
            })),
        }
    }

    fn catalog() -> FormatCatalog {
        let mut catalog = FormatCatalog::new();
        catalog.record(NV12.0, 0);
        catalog
    }

    fn bound_pool(fail: bool) -> (BufferPool<MockAllocator>, Rc<RefCell<Counters>>) {
        let (allocator, counters) = MockAllocator::new(fail);
        let mut pool = BufferPool::new(allocator, 2);
        pool.bind(HwdecBackend::probe(None)).unwrap();
        (pool, counters)
    }

    #[test]
    #[serial]
    fn unbound_pool_imports_nothing() {
        let (allocator, counters) = MockAllocator::new(false);
        let mut pool = BufferPool::new(allocator, 2);
        assert!(pool.get_entry(&frame(NV12), &catalog()).is_none());
        assert_eq!(counters.borrow().created, 0);
    }

    #[test]
    #[serial]
    fn cache_hit_does_not_import_again() {
        let (mut pool, counters) = bound_pool(false);
        let catalog = catalog();
        let frame = frame(NV12);

        let first = pool.get_entry(&frame, &catalog).map(|e| e.buffer);
        let second = pool.get_entry(&frame, &catalog).map(|e| e.buffer);

        assert_eq!(first, Some(1));
        assert_eq!(first, second);
        assert_eq!(counters.borrow().created, 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    #[serial]
    fn clear_forces_a_fresh_import() {
        let (mut pool, counters) = bound_pool(false);
        let catalog = catalog();
        let frame = frame(NV12);

        pool.get_entry(&frame, &catalog);
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(counters.borrow().destroyed, 1);

        let entry = pool.get_entry(&frame, &catalog).map(|e| e.buffer);
        assert_eq!(entry, Some(2));
        assert_eq!(counters.borrow().created, 2);
    }

    #[test]
    #[serial]
    fn clear_on_empty_pool_is_harmless() {
        let (mut pool, counters) = bound_pool(false);
        pool.clear();
        pool.clear();
        assert_eq!(counters.borrow().destroyed, 0);
    }

    #[test]
    #[serial]
    fn unsupported_format_leaves_no_entry_and_no_descriptor() {
        let (mut pool, counters) = bound_pool(false);
        let frame = frame(P010);
        let before = open_fd_count();

        assert!(pool.get_entry(&frame, &catalog()).is_none());

        assert_eq!(open_fd_count(), before);
        assert!(pool.is_empty());
        assert_eq!(counters.borrow().created, 0);
    }

    #[test]
    #[serial]
    fn buffer_creation_failure_leaks_nothing() {
        let (mut pool, _) = bound_pool(true);
        let frame = frame(NV12);
        let before = open_fd_count();

        assert!(pool.get_entry(&frame, &catalog()).is_none());

        assert_eq!(open_fd_count(), before);
        assert!(pool.is_empty());
    }

    #[test]
    #[serial]
    fn successful_import_closes_transient_descriptors() {
        let (mut pool, _) = bound_pool(false);
        let frame = frame(NV12);
        let before = open_fd_count();
        assert!(pool.get_entry(&frame, &catalog()).is_some());
        assert_eq!(open_fd_count(), before);
    }

    #[test]
    #[serial]
    fn empty_catalog_rejects_every_import() {
        let (mut pool, counters) = bound_pool(false);
        assert!(pool.get_entry(&frame(NV12), &FormatCatalog::new()).is_none());
        assert_eq!(counters.borrow().created, 0);
    }

    #[test]
    #[serial]
    fn grows_past_inline_capacity() {
        let (mut pool, _) = bound_pool(false);
        let catalog = catalog();
        let frames: Vec<_> = (0..6).map(|_| frame(NV12)).collect();
        for frame in &frames {
            assert!(pool.get_entry(frame, &catalog).is_some());
        }
        assert_eq!(pool.len(), 6);
    }

    #[test]
    #[serial]
    fn rebinding_requires_an_empty_pool() {
        let (mut pool, _) = bound_pool(false);
        pool.get_entry(&frame(NV12), &catalog());
        assert_eq!(
            pool.bind(HwdecBackend::probe(None)),
            Err(PoolError::AlreadyBound("drmprime"))
        );
        pool.clear();
        assert!(pool.bind(HwdecBackend::probe(None)).is_ok());
    }

    #[test]
    #[serial]
    fn drop_destroys_all_buffers() {
        let (mut pool, counters) = bound_pool(false);
        let catalog = catalog();
        let frames = [frame(NV12), frame(NV12)];
        for frame in &frames {
            pool.get_entry(frame, &catalog);
        }
        pool.free();
        assert_eq!(counters.borrow().destroyed, 2);
    }

    #[test]
    #[serial]
    fn reset_window_clears_exactly_its_length() {
        let (mut pool, counters) = bound_pool(false);
        let catalog = catalog();
        let frame = frame(NV12);

        pool.get_entry(&frame, &catalog);
        pool.request_reset();
        for _ in 0..5 {
            pool.begin_cycle();
            pool.get_entry(&frame, &catalog);
        }

        // first import, then one re-import per cleared cycle
        assert_eq!(counters.borrow().created, 3);
        assert_eq!(counters.borrow().destroyed, 2);
        assert!(!pool.reset_pending());
    }

    #[test]
    #[serial]
    fn cycles_without_reset_never_clear() {
        let mut window = ResetWindow::new(2);
        assert!(!window.advance());
        assert!(!window.advance());
        window.request();
        assert!(window.advance());
        assert!(window.is_active());
        assert!(window.advance());
        assert!(!window.is_active());
        assert!(!window.advance());
    }

    #[test]
    #[serial]
    fn zero_length_reset_window_never_clears_and_expires() {
        let mut window = ResetWindow::new(0);
        window.request();
        assert!(window.is_active());
        for _ in 0..5 {
            assert!(!window.advance());
        }
        assert!(!window.is_active());
    }

    #[test]
    #[serial]
    fn zero_length_reset_window_leaves_pool_alone() {
        let (allocator, counters) = MockAllocator::new(false);
        let mut pool = BufferPool::new(allocator, 0);
        pool.bind(HwdecBackend::probe(None)).unwrap();
        let catalog = catalog();
        let frame = frame(NV12);

        pool.get_entry(&frame, &catalog);
        pool.request_reset();
        pool.begin_cycle();
        pool.get_entry(&frame, &catalog);

        assert!(!pool.reset_pending());
        assert_eq!(counters.borrow().destroyed, 0);
        assert_eq!(counters.borrow().created, 1);
    }
}
