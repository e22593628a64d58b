//! Port names and port mappings.

/// Name of the port used when none is given
pub const DEFAULT_PORT: &str = "default";

/// Which output port feeds which input port of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub output: String,
    pub input: String,
}

impl PortMapping {
    pub fn new(output: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            input: input.into(),
        }
    }

    /// Connect the default output port to the named input port
    pub fn to_input(input: impl Into<String>) -> Self {
        Self::new(DEFAULT_PORT, input)
    }

    /// Connect the named output port to the default input port
    pub fn from_output(output: impl Into<String>) -> Self {
        Self::new(output, DEFAULT_PORT)
    }

    pub fn is_default(&self) -> bool {
        self.output == DEFAULT_PORT && self.input == DEFAULT_PORT
    }
}

impl Default for PortMapping {
    fn default() -> Self {
        Self::new(DEFAULT_PORT, DEFAULT_PORT)
    }
}

/// `thing` for the default port, `thing.port` otherwise.
pub(crate) fn qualified(thing: &str, port: &str) -> String {
    if port == DEFAULT_PORT {
        thing.to_string()
    } else {
        format!("{}.{}", thing, port)
    }
}
