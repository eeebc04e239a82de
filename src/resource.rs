//! Resource metadata and the collaborator trait supplying bytes to serve.

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::File;

use crate::context::RequestContext;
use crate::RangeBody;

/// Metadata for the entity being served, computed once per request.
///
/// Immutable after construction: every pipeline stage and the response
/// streamer read the same snapshot, so there is no order-dependent lazy
/// initialization to go wrong.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    /// Total entity size in bytes.
    pub length: u64,
    /// Last write time, if the resource has a meaningful one. Generated
    /// (in-memory) resources typically do not.
    pub last_modified: Option<SystemTime>,
    /// Opaque validator for the current content, stored unquoted.
    pub entity_tag: Option<String>,
    /// MIME type emitted as `Content-Type`.
    pub mime_type: String,
    /// Name offered to the client via `Content-Disposition`.
    pub file_name: Option<String>,
}

/// The byte source and policy surface the engine serves from.
///
/// This is the only coupling to the surrounding application: whatever
/// owns the real bytes (a file, a generated stream, a blob store) adapts
/// itself to this trait. Resource handles are released by dropping the
/// value, on every path out of a request.
pub trait MediaResource {
    type Body: RangeBody + Send + 'static;

    /// Metadata snapshot taken when the resource was opened.
    fn descriptor(&self) -> &ResourceDescriptor;

    /// Whether this request may see the resource at all. A `false`
    /// answer becomes a 403.
    fn is_authorized(&self, _ctx: &RequestContext) -> bool {
        true
    }

    /// Whether the entity actually exists for this request. A `false`
    /// answer becomes a 404. Adapters that cannot be constructed for a
    /// missing resource keep the default.
    fn exists(&self, _ctx: &RequestContext) -> bool {
        true
    }

    /// Consume the resource, yielding the seekable byte source.
    fn into_body(self) -> Self::Body;
}

/// A file-backed resource. Length, modification time, entity tag, and
/// MIME type are all captured at open time.
#[derive(Debug)]
pub struct FileResource {
    file: File,
    descriptor: ResourceDescriptor,
}

impl FileResource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<FileResource> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let metadata = file.metadata().await?;

        let length = metadata.len();
        let last_modified = metadata.modified().ok();
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());

        Ok(FileResource {
            file,
            descriptor: ResourceDescriptor {
                length,
                last_modified,
                entity_tag: last_modified.map(|time| entity_tag(length, time)),
                mime_type,
                file_name,
            },
        })
    }
}

impl MediaResource for FileResource {
    type Body = File;

    fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    fn into_body(self) -> File {
        self.file
    }
}

/// Weak-style validator derived from size and mtime, the same scheme
/// most file servers use.
fn entity_tag(length: u64, modified: SystemTime) -> String {
    let seconds = modified
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    format!("{length:x}-{seconds:x}")
}

/// A generated in-memory resource, served from a byte buffer.
#[derive(Debug, Clone)]
pub struct MemoryResource {
    data: Vec<u8>,
    descriptor: ResourceDescriptor,
}

impl MemoryResource {
    pub fn new(data: Vec<u8>, mime_type: impl Into<String>) -> MemoryResource {
        let length = data.len() as u64;
        MemoryResource {
            data,
            descriptor: ResourceDescriptor {
                length,
                last_modified: None,
                entity_tag: None,
                mime_type: mime_type.into(),
                file_name: None,
            },
        }
    }

    pub fn with_entity_tag(mut self, tag: impl Into<String>) -> MemoryResource {
        self.descriptor.entity_tag = Some(tag.into());
        self
    }

    pub fn with_last_modified(mut self, time: SystemTime) -> MemoryResource {
        self.descriptor.last_modified = Some(time);
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> MemoryResource {
        self.descriptor.file_name = Some(name.into());
        self
    }
}

impl MediaResource for MemoryResource {
    type Body = io::Cursor<Vec<u8>>;

    fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    fn into_body(self) -> io::Cursor<Vec<u8>> {
        io::Cursor::new(self.data)
    }
}
