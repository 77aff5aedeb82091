use crate::MonitorResource;

#[derive(derive_more::Display, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[display(
        fmt = "{resource} budget exceeded: {requested} bytes requested, {allocated} currently \
               allocated, {limit} bytes in budget of monitor '{monitor}'"
    )]
    BudgetExceeded {
        monitor: String,
        resource: MonitorResource,
        requested: u64,
        allocated: u64,
        limit: u64,
    },
    #[display(fmt = "monitor '{_0}' is stopped")]
    Stopped(String),
}

impl error_stack::Context for Error {}
