//! Menu domain types: the frozen render snapshot and the template layer.

pub mod snapshot;
pub mod template;

pub use snapshot::{
    resolve_snapshot, ExportOptions, MenuCategory, MenuItem, MenuPayload, Orientation,
    PaperFormat, RenderSnapshot, SnapshotError,
};
pub use template::{MenuTemplateRenderer, TemplateError, TemplateRenderer};
