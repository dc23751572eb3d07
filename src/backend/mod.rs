// Backend database contract.
//
// The proxy consumes backend databases only through the narrow traits in
// this module: a logical connection, an XA resource, and the datasource /
// driver factories that produce them. Real drivers live outside the crate
// and register themselves; the in-memory backend ships in-tree as the
// default driver for local runs and tests.

pub mod adapter;
pub mod connection;
pub mod driver;
pub mod memory;
pub mod types;

pub use adapter::{XaAdapterRegistry, XaDataSourceConfig};
pub use connection::{
    BackendConnection, ConnectionSettings, ExecuteOutcome, XaConnection, XaDataSource, XaResource,
};
pub use driver::{load_external_drivers, Driver, DriverRegistry};
pub use types::{
    ColumnMeta, IsolationLevel, QueryResult, Row, SqlValue, WireDecimal, XaEndFlags, XaRecoverScan,
    XaStartFlags, XaVote, Xid,
};
