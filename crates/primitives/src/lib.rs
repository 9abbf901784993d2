//! Secondary-index and scan primitives layered atop a [`graphstore_engine::Partition`]
//! (§4.6, §4.7, §4.9): write processors that keep index rows in step with
//! row writes, an online rebuild protocol for building an index without
//! stopping writes, a background task manager for compaction/flush/rebuild/
//! stats, and cursored partition-parallel scans.
//!
//! Everything here sits above the engine/durability/concurrency layers and
//! below the `Store` facade: it owns no partition or engine itself, only the
//! logic that turns a write request or a scan request into batches and
//! cursors against whatever partition it is handed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admin;
pub mod background;
pub mod index_rebuild;
pub mod index_state;
pub mod operation_log;
pub mod schema;
pub mod scan;
pub mod write_processors;

pub use admin::{
    compact_subtasks, flush_subtasks, rebuild_fulltext_subtasks, stats_subtask, AdminStatus, AdminTaskHandle, AdminTaskManager,
    PartitionStats, Subtask, TaskKind,
};
pub use background::{BackgroundScheduler, BackpressureError, SchedulerStats, TaskPriority};
pub use index_rebuild::{rebuild_edge_index, rebuild_tag_index, RebuildConfig};
pub use index_state::{IndexState, IndexStateTable, InFlightGuard};
pub use operation_log::{decode_operation_entry, encode_delete_entry, encode_modify_entry, OperationClock, OperationEntry};
pub use scan::{ScanCollector, ScanCursor, ScanRequest, ScanResult, PartitionScanResult};
pub use schema::{decode_field_ordered, encode_field_ordered, encode_field_values_ordered, project_index_fields, FieldValue, IndexDef, IndexField};
pub use write_processors::{
    AddEdgesProcessor, AddVerticesProcessor, DeleteEdgesProcessor, DeleteTagsProcessor, DeleteVerticesProcessor, EdgeDelete, EdgeWrite,
    IndexCatalog, RowCodec, UpdateEdgeProcessor, UpdateVertexProcessor, VertexWrite, WriteContext,
};
