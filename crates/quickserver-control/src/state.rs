use crate::admission::AdmissionController;
use crate::shutdown::ShutdownCoordinator;
use crate::task_queue::TaskQueue;
use crate::terminate::InstanceTerminator;

#[derive(Clone)]
pub struct AppState {
    pub shutdown: ShutdownCoordinator,
    pub queue: TaskQueue,
    pub admission: AdmissionController,
    pub terminator: InstanceTerminator,
    pub billing_enabled: bool,
}
