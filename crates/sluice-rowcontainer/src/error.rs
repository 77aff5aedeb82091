#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "failed to create temporary storage")]
    CreateTempStorage,
    #[display(fmt = "failed to {_0} temporary row file")]
    Io(&'static str),
    #[display(fmt = "disk budget exhausted while spilling rows")]
    DiskBudget,
    #[display(fmt = "memory budget exhausted")]
    MemoryBudget,
    #[display(fmt = "failed to decode spilled row")]
    Decode,
    #[display(fmt = "row container is closed")]
    Closed,
}

impl error_stack::Context for Error {}
