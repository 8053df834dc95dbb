//! Shared value types exchanged between the request cache, the surface cache and the decoders.

use std::fmt;

/// Pixel dimensions of an image or a decoded surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Bytes needed to hold an RGBA8888 surface of this size.
    pub const fn rgba_bytes(self) -> u64 {
        self.area() * 4
    }

    /// True when both dimensions are at least as large as `other`'s.
    pub const fn covers(self, other: Size) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Axis-aligned pixel rectangle, used for invalidation regions and animation frame placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub const fn from_size(size: Size) -> Self {
        Self { x: 0, y: 0, width: size.width, height: size.height }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge. Saturates for rectangles read from untrusted frame headers.
    pub const fn right(self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub const fn bottom(self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Smallest rectangle containing both `self` and `other`.
    pub fn union(self, other: Rect) -> Rect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect { x, y, width: right - x, height: bottom - y }
    }

    /// Clip the rectangle to a canvas of the given size.
    pub fn clamp_to(self, size: Size) -> Rect {
        let x = self.x.min(size.width);
        let y = self.y.min(size.height);
        let width = self.width.min(size.width - x);
        let height = self.height.min(size.height - y);
        Rect { x, y, width, height }
    }
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

id_type!(
    /// Identity of an [`crate::image::Image`]; keys its surfaces in the surface cache.
    ImageId
);
id_type!(
    /// Handle of an image request inside a loader's request arena.
    RequestId
);
id_type!(
    /// Handle given to a consumer by `ImageLoader::load_image`.
    ProxyId
);
id_type!(
    /// Identity of a [`crate::cache::CacheEntry`]; used by the eviction queue and the tracker.
    EntryId
);
id_type!(
    /// Transport channel handle allocated by the embedder's transport.
    ChannelId
);
id_type!(
    /// Opaque document token. Only compared, never dereferenced.
    DocumentId
);
id_type!(
    /// Opaque loading-context token (the "load id" a request was validated for).
    LoadContextId
);

/// Monotonic id allocator shared by the arenas in this crate.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub(crate) fn allocate(&mut self) -> u64 {
        self.next = self.next.wrapping_add(1).max(1);
        self.next
    }
}

/// Process-wide allocator for image ids, which must stay unique across loaders because the
/// surface cache is shared between them.
pub(crate) fn next_image_id() -> ImageId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    ImageId::new(NEXT.fetch_add(1, Ordering::Relaxed))
}
