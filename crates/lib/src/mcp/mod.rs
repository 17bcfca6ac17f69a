//! MCP server: telephony tools over the streamable HTTP or stdio transport.

mod requests;

pub use requests::{CheckStatusRequest, SmsRequest, VoiceCallRequest};

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ServerHandler,
};
use serde_json::Value;

use crate::tools::{ToolError, ToolFacade};

const INSTRUCTIONS: &str = "Place phone calls and send SMS through Vonage. \
voice_call and send_sms return a correlation id at once unless wait_for_result is true; \
voice_call_with_input and sms_with_input wait for the callee's answer by default. \
When a wait times out the request may still complete: poll check_call_status with the id.";

/// MCP server state. Cheap to clone; every session shares the same facade and store.
#[derive(Clone)]
pub struct TelephonyServer {
    tools: ToolFacade,
    tool_router: ToolRouter<Self>,
}

impl TelephonyServer {
    pub fn new(tools: ToolFacade) -> Self {
        Self {
            tools,
            tool_router: Self::tool_router(),
        }
    }
}

fn render(result: Result<Value, ToolError>) -> Result<String, String> {
    match result {
        Ok(v) => serde_json::to_string_pretty(&v).map_err(|e| e.to_string()),
        Err(e) => {
            log::warn!("tool failed: {}", e);
            Err(e.to_string())
        }
    }
}

#[tool_router]
impl TelephonyServer {
    #[tool(description = "Call a phone number and speak a message. Use for prompts like 'call this number', 'dial', 'make a phone call'.")]
    async fn voice_call(
        &self,
        Parameters(req): Parameters<VoiceCallRequest>,
    ) -> Result<String, String> {
        render(
            self.tools
                .voice_call(&req.to, &req.message, req.from.as_deref(), req.wait_for_result)
                .await,
        )
    }

    #[tool(description = "Send an SMS text message. Use for prompts like 'send a text', 'message this number', 'notify by SMS'.")]
    async fn send_sms(&self, Parameters(req): Parameters<SmsRequest>) -> Result<String, String> {
        render(
            self.tools
                .send_sms(&req.to, &req.text, req.from.as_deref(), req.wait_for_result)
                .await,
        )
    }

    #[tool(description = "Latest status of a call or SMS by id, or every tracked request when no id is given.")]
    async fn check_call_status(
        &self,
        Parameters(req): Parameters<CheckStatusRequest>,
    ) -> Result<String, String> {
        render(Ok(self.tools.check_call_status(req.call_uuid.as_deref())))
    }

    #[tool(description = "Call a phone number, speak a question, and return the callee's spoken or keyed answer.")]
    async fn voice_call_with_input(
        &self,
        Parameters(req): Parameters<VoiceCallRequest>,
    ) -> Result<String, String> {
        render(
            self.tools
                .voice_call_with_input(
                    &req.to,
                    &req.message,
                    req.from.as_deref(),
                    req.wait_for_result,
                )
                .await,
        )
    }

    #[tool(description = "Send an SMS and return the recipient's reply text.")]
    async fn sms_with_input(
        &self,
        Parameters(req): Parameters<SmsRequest>,
    ) -> Result<String, String> {
        render(
            self.tools
                .sms_with_input(&req.to, &req.text, req.from.as_deref(), req.wait_for_result)
                .await,
        )
    }
}

#[tool_handler]
impl ServerHandler for TelephonyServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(INSTRUCTIONS.to_string()),
        }
    }
}
