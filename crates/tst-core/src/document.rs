//! Document model for acquisition runs.
//!
//! Bluesky-style documents decouple the plans that drive hardware from
//! whatever stores or displays the data:
//!
//! - **StartDoc**: plan intent and metadata
//! - **DescriptorDoc**: schema for one data stream
//! - **EventDoc**: one row of a stream
//! - **StreamResourceDoc**: a file a device wrote outside the document stream
//! - **StopDoc**: completion status
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1+, one per stream)
//!    │       ├── StreamResourceDoc (0+, one per file-writing device)
//!    │       └── EventDoc (N)
//!    │
//! StopDoc (1)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Document types emitted during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run start - intent and metadata
    Start(StartDoc),
    /// Data stream descriptor - schema definition
    Descriptor(DescriptorDoc),
    /// One row of a stream
    Event(EventDoc),
    /// External file written by a device
    StreamResource(StreamResourceDoc),
    /// Run stop - completion status
    Stop(StopDoc),
}

impl Document {
    /// Get the document UID
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::StreamResource(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid, // Start doc UID is the run UID
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::StreamResource(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::StreamResource(_) => "stream_resource",
            Document::Stop(_) => "stop",
        }
    }
}

/// Start document - emitted at the beginning of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Plan type that generated this run
    pub plan_type: String,
    /// User-friendly plan name
    pub plan_name: String,
    /// Plan arguments
    pub plan_args: HashMap<String, String>,
    /// Run metadata (beamline, proposal, scan type, ...)
    pub metadata: HashMap<String, serde_json::Value>,
    /// Timestamp when run started
    pub time_ns: u64,
}

impl StartDoc {
    /// New start document with a fresh run uid.
    pub fn new(plan_type: &str, plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            plan_type: plan_type.to_string(),
            plan_name: plan_name.to_string(),
            plan_args: HashMap::new(),
            metadata: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    /// Add a plan argument.
    pub fn with_arg(mut self, key: &str, value: &str) -> Self {
        self.plan_args.insert(key.to_string(), value.to_string());
        self
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Descriptor document - defines the schema of one stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Stream name (e.g. "primary", "tomo_stream", "panda1_stream")
    pub name: String,
    /// Schema for data fields
    pub data_keys: HashMap<String, DataKey>,
    /// Timestamp
    pub time_ns: u64,
}

impl DescriptorDoc {
    /// New descriptor for a stream.
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            data_keys: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    /// Add a data key.
    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "string", "array"
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    pub shape: Vec<i32>,
    /// Source device or signal
    pub source: String,
    /// Physical units
    pub units: String,
    /// Whether the data lives in an external file
    pub external: bool,
}

impl DataKey {
    /// Scalar number data key
    pub fn scalar(source: &str, units: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            shape: vec![],
            source: source.to_string(),
            units: units.to_string(),
            external: false,
        }
    }

    /// Array data key stored in an external file
    pub fn external_array(source: &str, shape: Vec<i32>) -> Self {
        Self {
            dtype: "array".to_string(),
            shape,
            source: source.to_string(),
            units: String::new(),
            external: true,
        }
    }
}

/// Event document - one row of a stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Links to DescriptorDoc
    pub descriptor_uid: String,
    /// Sequence number within the stream, starting at 1
    pub seq_num: u32,
    /// Timestamp
    pub time_ns: u64,
    /// Field name -> value
    pub data: HashMap<String, serde_json::Value>,
    /// Field name -> timestamp
    pub timestamps: HashMap<String, u64>,
}

impl EventDoc {
    /// New empty event.
    pub fn new(run_uid: &str, descriptor_uid: &str, seq_num: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time_ns: now_ns(),
            data: HashMap::new(),
            timestamps: HashMap::new(),
        }
    }

    /// Add one field.
    pub fn with_datum(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        let ts = now_ns();
        self.data.insert(field.to_string(), value.into());
        self.timestamps.insert(field.to_string(), ts);
        self
    }
}

/// Stream resource document - a file written by a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResourceDoc {
    /// Unique resource ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Data key the file holds
    pub data_key: String,
    /// Location of the file
    pub uri: PathBuf,
    /// File format
    pub mimetype: String,
    /// Timestamp
    pub time_ns: u64,
}

impl StreamResourceDoc {
    /// New resource document.
    pub fn new(run_uid: &str, data_key: &str, uri: PathBuf, mimetype: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            data_key: data_key.to_string(),
            uri,
            mimetype: mimetype.to_string(),
            time_ns: now_ns(),
        }
    }
}

/// Stop document - emitted at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to StartDoc
    pub run_uid: String,
    /// Exit status: "success", "abort", "fail"
    pub exit_status: String,
    /// Reason for abort/failure
    pub reason: String,
    /// Timestamp when run ended
    pub time_ns: u64,
    /// Events per stream
    pub num_events: HashMap<String, u32>,
}

impl StopDoc {
    fn with_status(run_uid: &str, status: &str, reason: &str, num_events: HashMap<String, u32>) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: status.to_string(),
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_events,
        }
    }

    /// Run finished normally.
    pub fn success(run_uid: &str, num_events: HashMap<String, u32>) -> Self {
        Self::with_status(run_uid, "success", "", num_events)
    }

    /// Run was aborted by the operator.
    pub fn abort(run_uid: &str, reason: &str, num_events: HashMap<String, u32>) -> Self {
        Self::with_status(run_uid, "abort", reason, num_events)
    }

    /// Run failed.
    pub fn fail(run_uid: &str, reason: &str, num_events: HashMap<String, u32>) -> Self {
        Self::with_status(run_uid, "fail", reason, num_events)
    }
}
