// udmi-schema: UDMI device/cloud document types and serialization.
//
// Every document that crosses the device/cloud boundary is modelled here:
// state and config blocks, outbound events, site metadata, the persistent
// device record, and the reflector setup handshake documents.

pub mod config;
pub mod endpoint;
pub mod entry;
pub mod events;
pub mod metadata;
pub mod persistent;
pub mod state;
pub mod udmi;
pub mod version;

pub use config::{
    BlobBlobsetConfig, BlobsetConfig, Config, DiscoveryConfig, Enumerate, FamilyDiscoveryConfig,
    OperationConfig, PointPointsetConfig, PointsetConfig, SystemConfig,
};
pub use endpoint::{ClientId, EndpointConfiguration, Protocol, TransportKind};
pub use entry::{Entry, Level, category};
pub use events::{
    DiscoveryEvent, FamilyDiscoveryEvent, FeatureEnumeration, FeatureStage, PointEnumerationEvent,
    PointPointsetEvent, PointsetEvent, SystemEvent,
};
pub use metadata::{
    FamilyLocalnetModel, GatewayModel, LocalnetModel, Metadata, PointPointsetModel, PointsetModel,
    SystemModel,
};
pub use persistent::DevicePersistent;
pub use state::{
    BlobBlobsetState, BlobPhase, BlobsetState, DiscoveryState, FamilyDiscoveryState, Operation,
    PointPointsetState, PointsetState, State, SystemMode, SystemState, ValueState,
};
pub use udmi::{Envelope, ReflectorState, SetupUdmiConfig, SetupUdmiState, UdmiConfig, UdmiState};
pub use version::SchemaVersion;

/// Blob id carrying endpoint redirection data in `blobset.blobs`.
pub const IOT_ENDPOINT_CONFIG: &str = "_iot_endpoint_config";
