//! In-place history rewriting applied before each upstream call: image
//! elision beyond a most-recent-N window, and redaction of stale long tool
//! output. Both assume older blocks lose value as the conversation grows.

use crate::mcp::ToolContent;
use crate::session::{ChatMessage, ContentBlock};

pub const IMAGE_ELIDED_PLACEHOLDER: &str = "[image elided: older than retention window]";

const REDACTION_WINDOW: usize = 10;
const REDACTION_TEXT_THRESHOLD: usize = 1000;

/// Replace all but the final `keep` images with a textual placeholder.
/// Counts both user-supplied image blocks and images inside tool results;
/// `keep == 0` strips every image from prior turns.
pub fn elide_stale_images(messages: &mut [ChatMessage], keep: usize) {
    let total = count_images(messages);
    let mut to_elide = total.saturating_sub(keep);
    if to_elide == 0 {
        return;
    }

    for message in messages.iter_mut() {
        if to_elide == 0 {
            break;
        }
        let Some(blocks) = message.content.blocks_mut() else { continue };
        for block in blocks.iter_mut() {
            if to_elide == 0 {
                break;
            }
            match block {
                ContentBlock::ImageUrl { .. } => {
                    *block = ContentBlock::Text {
                        text: IMAGE_ELIDED_PLACEHOLDER.to_string(),
                    };
                    to_elide -= 1;
                }
                ContentBlock::ToolResult { content, .. } => {
                    for item in content.iter_mut() {
                        if to_elide == 0 {
                            break;
                        }
                        if matches!(item, ToolContent::Image { .. }) {
                            *item = ToolContent::Text {
                                text: IMAGE_ELIDED_PLACEHOLDER.to_string(),
                            };
                            to_elide -= 1;
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn count_images(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .filter_map(|m| match &m.content {
            crate::session::MessageContent::Blocks(blocks) => Some(blocks),
            _ => None,
        })
        .flatten()
        .map(|block| match block {
            ContentBlock::ImageUrl { .. } => 1,
            ContentBlock::ToolResult { content, .. } => content
                .iter()
                .filter(|c| matches!(c, ToolContent::Image { .. }))
                .count(),
            _ => 0,
        })
        .sum()
}

/// Truncate long text blocks inside tool results, keeping the final
/// `REDACTION_WINDOW` long texts intact. Truncated texts keep their first
/// `REDACTION_TEXT_THRESHOLD` characters plus a marker.
pub fn redact_stale_tool_text(messages: &mut [ChatMessage]) {
    let long_texts = messages
        .iter()
        .filter_map(|m| match &m.content {
            crate::session::MessageContent::Blocks(blocks) => Some(blocks),
            _ => None,
        })
        .flatten()
        .filter_map(|block| match block {
            ContentBlock::ToolResult { content, .. } => Some(content),
            _ => None,
        })
        .flatten()
        .filter(|c| matches!(c, ToolContent::Text { text } if text.len() > REDACTION_TEXT_THRESHOLD))
        .count();

    let mut to_redact = long_texts.saturating_sub(REDACTION_WINDOW);
    if to_redact == 0 {
        return;
    }

    for message in messages.iter_mut() {
        if to_redact == 0 {
            return;
        }
        let Some(blocks) = message.content.blocks_mut() else { continue };
        for block in blocks.iter_mut() {
            if to_redact == 0 {
                return;
            }
            let ContentBlock::ToolResult { content, .. } = block else { continue };
            for item in content.iter_mut() {
                if to_redact == 0 {
                    return;
                }
                if let ToolContent::Text { text } = item {
                    if text.len() > REDACTION_TEXT_THRESHOLD {
                        let boundary = text
                            .char_indices()
                            .take_while(|(i, _)| *i < REDACTION_TEXT_THRESHOLD)
                            .last()
                            .map(|(i, c)| i + c.len_utf8())
                            .unwrap_or(0);
                        text.truncate(boundary);
                        text.push_str(" <redacted content>");
                        to_redact -= 1;
                    }
                }
            }
        }
    }
}
