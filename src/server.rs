//! ask-continue MCP server implementation using the official rmcp SDK.
//!
//! Exposes a single `ask_continue` tool that blocks until the user answers
//! through the editor extension, then marshals the reply into MCP content
//! blocks.

use std::sync::OnceLock;

use indoc::indoc;
use regex::Regex;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    service::RequestContext,
    tool, tool_handler, tool_router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::dispatch::{AskError, Dispatcher};

/// Marker the extension inserts between the user's text and any attached
/// image data URLs.
const IMAGE_MARKER: &str = "[image attached]";

const CONTINUE_REMINDER: &str = "\
    Reminder: once you have carried out these instructions, call `ask_continue` \
    again before ending your reply. That call is the only way the user can keep \
    the conversation going.";

/// Parameters for the ask_continue tool
#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct AskContinueParams {
    /// Brief summary of what was just completed and why you are checking in
    pub reason: String,
}

/// An image embedded in a user reply as a base64 data URL.
#[derive(Debug, PartialEq, Eq)]
struct EmbeddedImage {
    subtype: String,
    data: String,
}

/// ask-continue MCP server
///
/// Bridges the MCP stdio transport to the HTTP dispatch/callback machinery.
#[derive(Clone)]
pub struct AskContinueServer {
    dispatcher: Dispatcher,
    tool_router: ToolRouter<AskContinueServer>,
}

#[tool_router]
impl AskContinueServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "\
        Ask the user whether to continue the conversation. Call this tool at \
        the end of every reply, after completing any task, and after answering \
        any question - even when you believe the conversation is finished, the \
        user decides. Do not end a reply without calling it. The call blocks \
        until the user answers in their editor; an empty answer means the \
        conversation is over, anything else is the next set of instructions.\
    ")]
    async fn ask_continue(
        &self,
        Parameters(params): Parameters<AskContinueParams>,
    ) -> Result<CallToolResult, McpError> {
        info!("ask_continue invoked: {}", params.reason);

        match self.dispatcher.ask(&params.reason).await {
            Ok(reply) => Ok(render_reply(&reply)),
            Err(AskError::Cancelled) => {
                info!("user cancelled the conversation");
                Ok(CallToolResult::success(vec![Content::text(
                    "The user dismissed the prompt. The conversation ends here.",
                )]))
            }
            Err(e) => {
                error!("ask_continue failed: {e}");
                Err(McpError::internal_error(
                    "Failed to reach the editor extension",
                    Some(serde_json::json!({ "error": e.to_string() })),
                ))
            }
        }
    }
}

/// Turn the raw reply string into MCP content blocks.
///
/// An empty reply ends the conversation. A non-empty reply becomes a
/// continue-with-instructions text block, with any attached images split out
/// into image content.
fn render_reply(reply: &str) -> CallToolResult {
    if reply.trim().is_empty() {
        return CallToolResult::success(vec![Content::text(
            "The user chose to end the conversation here.",
        )]);
    }

    let (text, images) = split_images(reply);
    let mut content = Vec::new();

    if text.is_empty() {
        content.push(Content::text(
            "The user wants to continue and attached the following image(s):",
        ));
    } else {
        content.push(Content::text(format!(
            "The user wants to continue and provided these instructions:\n\n{text}"
        )));
    }

    for image in images {
        content.push(Content::image(image.data, format!("image/{}", image.subtype)));
    }

    content.push(Content::text(CONTINUE_REMINDER));
    CallToolResult::success(content)
}

/// Split a reply into its text part and any images attached after the marker.
fn split_images(reply: &str) -> (String, Vec<EmbeddedImage>) {
    let Some((text, attachments)) = reply.split_once(IMAGE_MARKER) else {
        return (reply.trim().to_string(), Vec::new());
    };

    static IMAGE_RE: OnceLock<Regex> = OnceLock::new();
    let re = IMAGE_RE
        .get_or_init(|| Regex::new(r"data:image/([^;]+);base64,([^\s]+)").expect("image regex"));

    let images = re
        .captures_iter(attachments)
        .map(|captures| EmbeddedImage {
            subtype: captures[1].to_string(),
            data: captures[2].to_string(),
        })
        .collect();

    (text.trim().to_string(), images)
}

#[tool_handler]
impl ServerHandler for AskContinueServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "ask-continue-mcp".to_string(),
                version: "0.1.0".to_string(),
                icons: None,
                title: None,
                website_url: None,
            },
            instructions: Some(indoc! {"
                This server keeps the conversation open across replies. Call the
                `ask_continue` tool at the end of every reply; it blocks until the
                user answers in their editor and returns their next instructions.
                An empty answer means the user is done.
            "}.to_string()),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        info!("MCP client connected and initialized");
        Ok(self.get_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_reply_ends_conversation() {
        let result = render_reply("   ");
        assert_eq!(result.content.len(), 1);
        let text = result.content[0].as_text().unwrap();
        assert!(text.text.contains("end the conversation"));
    }

    #[test]
    fn plain_reply_becomes_instructions() {
        let result = render_reply("also run the tests");
        let text = result.content[0].as_text().unwrap();
        assert!(text.text.contains("also run the tests"));
        // Trailing reminder is always present on continue.
        let reminder = result.content.last().unwrap().as_text().unwrap();
        assert!(reminder.text.contains("ask_continue"));
    }

    #[test]
    fn split_images_without_marker_returns_text_only() {
        let (text, images) = split_images("just words");
        assert_eq!(text, "just words");
        assert!(images.is_empty());
    }

    #[test]
    fn split_images_extracts_data_urls() {
        let reply = format!(
            "fix the header {IMAGE_MARKER} data:image/png;base64,AAAA data:image/jpeg;base64,BBBB"
        );
        let (text, images) = split_images(&reply);
        assert_eq!(text, "fix the header");
        assert_eq!(
            images,
            vec![
                EmbeddedImage { subtype: "png".into(), data: "AAAA".into() },
                EmbeddedImage { subtype: "jpeg".into(), data: "BBBB".into() },
            ]
        );
    }

    #[test]
    fn image_only_reply_renders_image_content() {
        let reply = format!("{IMAGE_MARKER} data:image/png;base64,AAAA");
        let result = render_reply(&reply);
        // Intro text, one image, reminder.
        assert_eq!(result.content.len(), 3);
        assert!(result.content[1].as_image().is_some());
    }
}
