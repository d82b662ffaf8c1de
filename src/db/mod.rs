//! Database access gateway: pool manager, prepared-statement cache,
//! SQL validator, typed values and event streams.

pub mod events;
pub mod pool;
pub mod prepared;
pub mod validator;
pub mod value;

pub use events::{EventBus, PoolEvent, QueryEvent};
pub use pool::{ColumnSpec, ConnectionPoolManager, PoolHealth, PoolStats, QueryResult};
pub use prepared::{CacheStats, PreparedStatement, PreparedStatementCache, generate_name};
pub use validator::{QueryType, QueryValidator, ValidationResult};
pub use value::{CellValue, FieldDescriptor, SqlParam, ValueKind};
