pub mod common;
pub mod job;
pub mod pod;
pub mod pvc;
pub mod quantity;
pub mod service;

pub use common::{
    API_VERSION, FIELD_MANAGER, KIND, component_labels, component_ops_labels, create_if_absent,
    delete_if_present, ops_labels, ops_selector, owner_reference, selector,
};
