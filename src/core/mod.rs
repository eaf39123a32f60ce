pub mod group;
pub mod order;
pub mod temp_id;
pub mod todo;

pub use group::{Group, GroupPatch, NewGroup, Theme};
pub use order::SortRank;
pub use todo::{NewTodo, Todo, TodoPatch};

/// What the cache needs to know about a cached row.
pub trait Record {
    fn id(&self) -> &str;
    fn sort_order(&self) -> i64;
    fn set_sort_order(&mut self, sort_order: i64);
    /// Refresh `updated_at` after a local edit.
    fn touch(&mut self);
}
