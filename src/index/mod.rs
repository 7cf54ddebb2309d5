pub mod compiler;
pub mod file;
pub mod function;
pub mod group;
pub mod memory;
pub mod storage;
pub mod updater;
pub mod view;

pub use compiler::{SimpleCompiler, SimpleMap, SIMPLE_LANGUAGE};
pub use file::FileViewStorage;
pub use function::{
    compile_definition, BuiltinReduce, Emitter, InvalidationPolicy, MapFunction, ReduceFunction,
    ViewCompiler, ViewDefinition,
};
pub use group::{group_name, GroupLocks};
pub use memory::{IndexState, MemoryViewStorage};
pub use storage::{IndexRow, IndexSnapshot, IndexTransaction, KeyRange, ViewStorage};
pub use updater::{
    update_index, update_index_alone, update_index_alone_with, update_index_with, update_indexes,
    update_indexes_with, UpdateControl,
};
pub use view::{validate_view_name, View};
