//! Cube schema model: hierarchies, members, cubes, roles and the
//! per-statement evaluation context.

pub mod catalog;
pub mod context;
pub mod cube;
pub mod hierarchy;
pub mod member;
pub mod role;

pub use catalog::{Catalog, CatalogBuilder, HierarchySpec, LevelSpec};
pub use context::{CancelToken, EvalContext};
pub use cube::{
    AggTable, Aggregator, ArithOp, Cube, CubeRef, DimensionUsage, Measure, MeasureExpr, MeasureKey,
    VirtualCube,
};
pub use hierarchy::{Hierarchy, HierarchyId, HierarchyKey, Level, LevelId, LevelKey, SnowflakeJoin};
pub use member::{
    CalcBody, CalcExpansion, KeyValue, Member, MemberArena, MemberId, MemberKey, MemberKind,
    OpaqueValue,
};
pub use role::{GrantDigest, HierarchyAccess, Role, RollupPolicy};
