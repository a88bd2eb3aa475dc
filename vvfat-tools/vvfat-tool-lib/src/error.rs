use std::fmt::Formatter;

#[derive(Debug, PartialEq, Clone)]
pub struct ToolError {
    message: String,
}

impl ToolError {
    pub fn new(message: &str) -> Self {
        return ToolError {
            message: String::from(message),
        };
    }

    pub fn get_message(&self) -> String {
        return self.message.clone();
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        return write!(f, "{}", self.message);
    }
}
