// udmi-conformance: workspace facade.
//
// Re-exports the device engine, the reflector client, and the shared schema,
// logging, and transport crates so end-to-end suites can depend on one crate.

pub use pubber;
pub use udmi_log as log;
pub use udmi_reflector as reflector;
pub use udmi_schema as schema;
pub use udmi_transport as transport;
