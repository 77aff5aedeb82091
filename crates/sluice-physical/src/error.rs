#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "invalid flow spec yaml")]
    ParseYaml,
    #[display(fmt = "failed to serialize flow spec")]
    SerializeYaml,
}

impl error_stack::Context for Error {}
