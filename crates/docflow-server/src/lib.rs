//! HTTP boundary for the document pipeline. The crate owns the router, the
//! wire DTOs, and the [`DocumentService`] seam the application implements.

mod server;

pub use server::{
    build_router, serve, BatchReply, DocumentService, DynDocumentService, IntakeReceipt,
    ServeError, ServiceError, StagedUpload, TaskSnapshot, DEFAULT_MAX_UPLOAD_BYTES,
};
