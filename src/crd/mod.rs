//! Custom Resource Definitions for the MongoDB operator

mod mongodb;
mod types;

pub use mongodb::{MongoDB, MongoDBSpec, MongoDBStatus, Topology};
pub use types::{
    BackupSpec, Condition, ConditionStatus, ConfigServerSpec, InstancePhase, IssuerRef,
    MongosSpec, MonitoringSpec, ReplicaSetSpec, RestoreSpec, ServiceExposureSpec, ServiceType,
    ShardedSpec, ShardsSpec, StorageSpec, TlsSpec, VersionSpec, DEFAULT_DATA_DIR,
    DEFAULT_EXPORTER_IMAGE, DEFAULT_MONGODB_REPOSITORY, DEFAULT_STORAGE_SIZE,
};
