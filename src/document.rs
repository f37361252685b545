use crate::payload::PayloadBuilder;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical identifier of a document within a collection. Carries no ownership
/// semantics; totally ordered so it can serve as a map or index key.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LocalDocumentId(u64);

impl LocalDocumentId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for LocalDocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
enum Payload {
    #[default]
    Empty,
    /// Non-owning pointer into storage-engine memory. Valid only for the
    /// engine's stability window (end of the current read transaction or the
    /// next mutation of the document, whichever comes first).
    Unmanaged { ptr: *const u8, len: usize },
    /// Owned copy; released when the handle is reset or dropped.
    Managed { bytes: Vec<u8> },
    /// Incrementally filled buffer handed out by `prepare_string_usage`. No
    /// byte pointer is published yet, so the handle still reports empty.
    StringStaging { buf: String },
    /// Staged buffer finalized by `set_managed_after_string_usage`; owned
    /// bytes, equivalent to `Managed` for all readers.
    StringManaged { buf: String },
}

/// Handle to one document's serialized bytes under exactly one of three
/// ownership regimes: a zero-copy borrow from the storage engine
/// (`Unmanaged`), an owned buffer (`Managed`), or a transitional owned string
/// being assembled (`StringStaging`/`StringManaged`).
///
/// Reading from an empty handle is a programming-contract violation, not a
/// recoverable error: check `is_empty()` first.
#[derive(Debug, Default)]
pub struct DocumentResult {
    id: LocalDocumentId,
    payload: Payload,
}

// An Unmanaged handle may only cross a thread boundary while the engine's
// stability window is still open; callers crossing a boundary where the
// window may have lapsed must first take an owned copy via `clone_to`. All
// other states own their bytes.
unsafe impl Send for DocumentResult {}

impl DocumentResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopts a non-owning reference to engine-owned bytes.
    ///
    /// # Safety
    ///
    /// `bytes` must remain valid and unmodified until this handle is reset,
    /// reassigned, or dropped, or until the engine's stability window closes,
    /// whichever comes first. The handle cannot detect a violation; holding
    /// the reference past the window is undefined behavior at the read site.
    pub unsafe fn set_unmanaged(&mut self, bytes: &[u8], id: LocalDocumentId) {
        self.payload = Payload::Unmanaged {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        };
        self.id = id;
    }

    /// Copies `bytes` into handle-owned storage. Use when the result must
    /// survive past the engine's stability window.
    pub fn set_managed(&mut self, bytes: &[u8], id: LocalDocumentId) {
        self.payload = Payload::Managed {
            bytes: bytes.to_vec(),
        };
        self.id = id;
    }

    /// Adopts an already-owned buffer without copying.
    pub fn set_managed_buffer(&mut self, bytes: Vec<u8>, id: LocalDocumentId) {
        self.payload = Payload::Managed { bytes };
        self.id = id;
    }

    /// Resets the handle and returns a buffer for the caller to fill
    /// incrementally (decompression, transformation). The handle reports
    /// empty until `set_managed_after_string_usage` publishes the content.
    pub fn prepare_string_usage(&mut self) -> &mut String {
        self.reset();
        self.payload = Payload::StringStaging { buf: String::new() };
        match &mut self.payload {
            Payload::StringStaging { buf } => buf,
            _ => unreachable!(),
        }
    }

    /// Publishes the staged buffer as this handle's owned payload. Calling
    /// this without a prior `prepare_string_usage` is a usage error.
    pub fn set_managed_after_string_usage(&mut self, id: LocalDocumentId) {
        let staged = std::mem::take(&mut self.payload);
        match staged {
            Payload::StringStaging { buf } => {
                self.payload = Payload::StringManaged { buf };
                self.id = id;
            }
            other => {
                debug_assert!(false, "set_managed_after_string_usage without staging");
                self.payload = other;
            }
        }
    }

    /// Releases owned bytes (if any) and returns the handle to empty.
    /// Idempotent.
    pub fn reset(&mut self) {
        self.payload = Payload::Empty;
        self.id = LocalDocumentId::default();
    }

    /// Produces an independent owned copy in `target`, regardless of this
    /// handle's state. An Unmanaged source is copied, not re-referenced: the
    /// clone must stay valid after the source's stability window closes.
    pub fn clone_to(&self, target: &mut DocumentResult) {
        if self.is_empty() {
            target.reset();
            return;
        }
        target.set_managed(self.bytes(), self.id);
    }

    /// Transfers ownership from `source` into this handle, leaving `source`
    /// empty. Owning payloads move without copying. An Unmanaged source is
    /// re-adopted, still non-owning and still zero-copy: this handle inherits
    /// the engine's original stability window, which the caller must continue
    /// to respect.
    pub fn move_from(&mut self, source: &mut DocumentResult) {
        let payload = std::mem::take(&mut source.payload);
        let id = source.id;
        source.reset();
        match payload {
            Payload::Empty => self.reset(),
            Payload::Unmanaged { ptr, len } => {
                self.payload = Payload::Unmanaged { ptr, len };
                self.id = id;
            }
            Payload::Managed { bytes } => {
                self.payload = Payload::Managed { bytes };
                self.id = id;
            }
            // A staged buffer moves like a finalized one; the source's id is
            // whatever was last assigned, matching direct managed assignment.
            Payload::StringStaging { buf } | Payload::StringManaged { buf } => {
                self.payload = Payload::StringManaged { buf };
                self.id = id;
            }
        }
    }

    pub fn local_document_id(&self) -> LocalDocumentId {
        debug_assert!(!self.is_empty(), "local_document_id() on empty handle");
        self.id
    }

    /// Current serialized bytes. Panics if the handle is empty; callers must
    /// check `is_empty()` first.
    pub fn bytes(&self) -> &[u8] {
        match &self.payload {
            // Validity rests on the `set_unmanaged` contract.
            Payload::Unmanaged { ptr, len } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            Payload::Managed { bytes } => bytes,
            Payload::StringManaged { buf } => buf.as_bytes(),
            Payload::Empty | Payload::StringStaging { .. } => {
                panic!("bytes() on empty DocumentResult")
            }
        }
    }

    pub fn len(&self) -> usize {
        match &self.payload {
            Payload::Unmanaged { len, .. } => *len,
            Payload::Managed { bytes } => bytes.len(),
            Payload::StringManaged { buf } => buf.len(),
            Payload::Empty | Payload::StringStaging { .. } => 0,
        }
    }

    /// True iff no byte reference is currently published. A handle mid
    /// string-staging counts as empty.
    pub fn is_empty(&self) -> bool {
        matches!(
            self.payload,
            Payload::Empty | Payload::StringStaging { .. }
        )
    }

    /// True iff the bytes are engine-owned and stable, so serialization may
    /// emit a zero-copy external reference instead of an inline copy.
    pub fn can_use_in_external(&self) -> bool {
        matches!(self.payload, Payload::Unmanaged { .. })
    }

    /// Appends the document's bytes to `builder`. With `allow_externals` set
    /// and an Unmanaged payload, an external reference is emitted instead of
    /// inlining the bytes; the caller accepts the aliasing hazard.
    pub fn add_to_builder(&self, builder: &mut PayloadBuilder, allow_externals: bool) {
        debug_assert!(!self.is_empty(), "add_to_builder() on empty handle");
        match &self.payload {
            Payload::Unmanaged { ptr, len } if allow_externals => {
                builder.append_external(*ptr, *len);
            }
            _ => builder.append_inline(self.bytes()),
        }
    }
}
