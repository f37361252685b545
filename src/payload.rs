use smallvec::SmallVec;

/// Segment tag: document bytes embedded in the stream.
pub const TAG_INLINE: u8 = 0x01;
/// Segment tag: pointer-sized reference to engine-owned bytes. Zero-copy;
/// only valid while the referenced buffer's stability window is open.
pub const TAG_EXTERNAL: u8 = 0x1D;

/// Byte-stream builder consumed by `DocumentResult::add_to_builder`. Each
/// appended document becomes one tagged segment: inline segments carry a
/// length-prefixed copy of the bytes, external segments carry a raw pointer
/// and length.
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    bytes: SmallVec<[u8; 64]>,
    segments: usize,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_inline(&mut self, bytes: &[u8]) {
        self.bytes.push(TAG_INLINE);
        self.bytes.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.bytes.extend_from_slice(bytes);
        self.segments += 1;
    }

    pub fn append_external(&mut self, ptr: *const u8, len: usize) {
        self.bytes.push(TAG_EXTERNAL);
        self.bytes
            .extend_from_slice(&(ptr as usize).to_be_bytes());
        self.bytes.extend_from_slice(&(len as u32).to_be_bytes());
        self.segments += 1;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn segment_count(&self) -> usize {
        self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments == 0
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.segments = 0;
    }

    pub fn segments(&self) -> Segments<'_> {
        Segments {
            bytes: &self.bytes,
            pos: 0,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Segment<'a> {
    Inline(&'a [u8]),
    External { ptr: *const u8, len: usize },
}

impl Segment<'_> {
    /// Resolves the segment to its bytes.
    ///
    /// # Safety
    ///
    /// For an external segment the referenced buffer must still be within its
    /// stability window; the builder records only the pointer.
    pub unsafe fn resolve(&self) -> &[u8] {
        match self {
            Segment::Inline(bytes) => bytes,
            Segment::External { ptr, len } => std::slice::from_raw_parts(*ptr, *len),
        }
    }
}

/// Decoding iterator over a builder's segments. Stops at the first malformed
/// segment; builder-produced streams are always well formed.
pub struct Segments<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Segment<'a>> {
        let tag = *self.bytes.get(self.pos)?;
        self.pos += 1;
        match tag {
            TAG_INLINE => {
                let len = self.read_u32()? as usize;
                let bytes = self.bytes.get(self.pos..self.pos + len)?;
                self.pos += len;
                Some(Segment::Inline(bytes))
            }
            TAG_EXTERNAL => {
                let ptr = self.read_usize()? as *const u8;
                let len = self.read_u32()? as usize;
                Some(Segment::External { ptr, len })
            }
            _ => None,
        }
    }
}

impl Segments<'_> {
    fn read_u32(&mut self) -> Option<u32> {
        let raw = self.bytes.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes(raw.try_into().ok()?))
    }

    fn read_usize(&mut self) -> Option<usize> {
        const WIDTH: usize = std::mem::size_of::<usize>();
        let raw = self.bytes.get(self.pos..self.pos + WIDTH)?;
        self.pos += WIDTH;
        Some(usize::from_be_bytes(raw.try_into().ok()?))
    }
}
