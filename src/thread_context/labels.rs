use crate::runtime::{AllocatedObject, ObjectClass, VmValueType};

pub const THREAD_ID: &str = "thread id";
pub const THREAD_NAME: &str = "thread name";
pub const LOCAL_ROOT_SPAN_ID: &str = crate::recorder::profile::LOCAL_ROOT_SPAN_ID_LABEL;
pub const SPAN_ID: &str = "span id";
pub const PROFILER_OVERHEAD: &str = "profiler overhead";
pub const RUBY_VM_TYPE: &str = "ruby vm type";
pub const ALLOCATION_CLASS: &str = "allocation class";
pub const STATE: &str = "state";

/// thread id, thread name, two trace ids, profiler overhead, vm type, allocation class, state
pub const MAX_LABEL_COUNT: usize = 8;

pub const MAIN_THREAD_NAME: &str = "main";

const IMEMO_CLASS_NAME: &str = "(VM Internal, T_IMEMO)";

/// Only web requests carry an endpoint worth reporting
pub fn should_collect_resource(root_span_type: &str) -> bool {
    root_span_type == "web" || root_span_type == "proxy"
}

/// Class name reported for an allocated object
pub fn allocation_class_name(object: &AllocatedObject) -> &str {
    let vm_type = object.vm_type;

    if vm_type.has_user_class() {
        return match &object.class {
            ObjectClass::Named(name) if !name.is_empty() => name,
            // Some internal objects are allocated without a class
            _ => vm_type.fallback_class_name(),
        };
    }

    if vm_type == VmValueType::Imemo {
        IMEMO_CLASS_NAME
    } else {
        vm_type.as_str()
    }
}
