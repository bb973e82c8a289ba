use crate::protocol::FunctionDeclaration;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod image;

pub use image::{GeminiImageGenerator, ImageGenerator};

pub const GENERATE_IMAGE: &str = "generate_image";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Invalid tool parameters: {0}")]
    InvalidParameters(String),
    #[error("Tool timeout after {0:?}")]
    Timeout(Duration),
    #[error("Tool execution was cancelled")]
    Cancelled,
}

impl ToolError {
    /// Payload of the failed tool result sent back to the model.
    pub fn to_response(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}

/// Result of a finished tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Payload for the model
    pub response: Value,
    /// Line shown in the transcript
    pub transcript_text: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub struct ToolRegistry {
    tools: Vec<Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool
    pub fn register_tool(&mut self, tool: Tool) {
        self.tools.push(tool);
    }

    /// Get available tools
    pub fn get_tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Find a tool by name
    pub fn find_tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// Declarations for the session setup
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with every tool the tutor offers the model
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register_tool(Tool {
        name: GENERATE_IMAGE.to_string(),
        description: "Draw a friendly, child-appropriate picture and show it to the learner. \
                      Use it whenever the learner asks to see something."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Detailed description of the picture to draw"
                }
            },
            "required": ["prompt"]
        }),
    });

    registry
}

/// Dispatches tool calls by name, bounded by a timeout.
pub struct ToolExecutor {
    registry: ToolRegistry,
    images: Arc<dyn ImageGenerator>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, images: Arc<dyn ImageGenerator>, timeout: Duration) -> Self {
        Self {
            registry,
            images,
            timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Transcript line shown while the call is running
    pub fn placeholder_text(&self, name: &str, arguments: &Value) -> String {
        match (name, prompt_argument(arguments)) {
            (GENERATE_IMAGE, Ok(prompt)) => format!("🎨 Drawing a picture of {}...", prompt),
            _ => format!("🛠️ Working on {}...", name),
        }
    }

    /// Execute a tool by name with cancellation support
    pub async fn execute(
        &self,
        name: &str,
        arguments: Value,
        cancel_token: CancellationToken,
    ) -> Result<ToolOutput, ToolError> {
        if cancel_token.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        if self.registry.find_tool(name).is_none() {
            return Err(ToolError::NotFound(name.to_string()));
        }

        log::info!("🛠️ Running tool {}", name);

        let run = async {
            match name {
                GENERATE_IMAGE => self.generate_image(arguments).await,
                other => Err(ToolError::NotFound(other.to_string())),
            }
        };

        tokio::select! {
            _ = cancel_token.cancelled() => Err(ToolError::Cancelled),
            result = tokio::time::timeout(self.timeout, run) => {
                result.map_err(|_| ToolError::Timeout(self.timeout))?
            }
        }
    }

    async fn generate_image(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let prompt = prompt_argument(&arguments)?;
        let image_url = self.images.generate(&prompt).await?;

        Ok(ToolOutput {
            response: json!({
                "status": "success",
                "message": "The picture is now on the learner's screen."
            }),
            transcript_text: format!("Here is your picture of {}!", prompt),
            image_url: Some(image_url),
        })
    }
}

fn prompt_argument(arguments: &Value) -> Result<String, ToolError> {
    arguments
        .get("prompt")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidParameters("'prompt' must be a non-empty string".to_string()))
}
