pub mod hierarchy;
pub mod sync;

pub use hierarchy::{OrgError, OrgTree, PickerNode, MAX_ANCESTOR_HOPS};
pub use sync::{plan_projection, LegacyOrgSnapshot, ProjectionPlan, SyncReport};
