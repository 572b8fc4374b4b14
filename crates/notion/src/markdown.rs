//! Markdown ⇄ block conversion.
//!
//! Parsing walks pulldown-cmark events and keeps the subset that maps
//! one-to-one onto flat page content: headings up to level 3 (deeper ones
//! are clamped), paragraphs, bulleted/numbered/to-do list items, quotes,
//! code blocks and dividers.  Nested list items are flattened into their
//! own blocks.  Inline formatting is re-emitted as literal markdown so the
//! text survives a round trip unchanged.  Both functions are pure.

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag, TagEnd};

use crate::block::Block;

const DEFAULT_CODE_LANGUAGE: &str = "plain text";

/// Block currently collecting text.
#[derive(Debug, Clone)]
enum Pending {
    Heading(u8),
    Paragraph,
    Quote,
    Item { ordered: bool, checked: Option<bool> },
    Code(String),
}

#[derive(Default)]
struct BlockBuilder {
    blocks: Vec<Block>,
    pending: Option<Pending>,
    text: String,
    /// One entry per open list: `true` for ordered lists.
    lists: Vec<bool>,
    quote_depth: usize,
    links: Vec<String>,
}

impl BlockBuilder {
    fn begin(&mut self, pending: Pending) {
        self.finish();
        self.pending = Some(pending);
    }

    fn finish(&mut self) {
        let text = std::mem::take(&mut self.text);
        let block = match self.pending.take() {
            None => None,
            Some(Pending::Code(language)) => {
                Some(Block::code(&language, text.strip_suffix('\n').unwrap_or(&text)))
            }
            Some(pending) => {
                let text = text.trim();
                if text.is_empty() {
                    None
                } else {
                    Some(match pending {
                        Pending::Heading(level) => Block::heading(level, text),
                        Pending::Quote => Block::quote(text),
                        Pending::Item { checked: Some(checked), .. } => Block::to_do(text, checked),
                        Pending::Item { ordered: true, .. } => Block::numbered(text),
                        Pending::Item { .. } => Block::bulleted(text),
                        Pending::Paragraph | Pending::Code(_) => Block::paragraph(text),
                    })
                }
            }
        };
        if let Some(block) = block {
            self.blocks.push(block);
        }
    }

    /// Loose text outside any open block starts a paragraph (or a quote
    /// inside a blockquote).
    fn push_text(&mut self, text: &str) {
        if self.pending.is_none() {
            self.pending = Some(self.paragraph_kind());
        }
        self.text.push_str(text);
    }

    fn paragraph_kind(&self) -> Pending {
        if self.quote_depth > 0 {
            Pending::Quote
        } else {
            Pending::Paragraph
        }
    }

    fn event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => self.begin(Pending::Heading(heading_level(level))),
            Event::End(TagEnd::Heading(_)) => self.finish(),

            // Paragraphs inside a list item belong to the item.
            Event::Start(Tag::Paragraph) => match self.pending {
                Some(Pending::Item { .. }) => {
                    if !self.text.is_empty() {
                        self.text.push('\n');
                    }
                }
                _ => self.begin(self.paragraph_kind()),
            },
            Event::End(TagEnd::Paragraph) => {
                if !matches!(self.pending, Some(Pending::Item { .. })) {
                    self.finish();
                }
            }

            Event::Start(Tag::List(first)) => {
                self.finish();
                self.lists.push(first.is_some());
            }
            Event::End(TagEnd::List(_)) => {
                self.lists.pop();
            }
            Event::Start(Tag::Item) => {
                let ordered = self.lists.last().copied().unwrap_or(false);
                self.begin(Pending::Item { ordered, checked: None });
            }
            Event::End(TagEnd::Item) => self.finish(),
            Event::TaskListMarker(done) => {
                if let Some(Pending::Item { checked, .. }) = &mut self.pending {
                    *checked = Some(done);
                }
            }

            Event::Start(Tag::BlockQuote(_)) => {
                self.finish();
                self.quote_depth += 1;
            }
            Event::End(TagEnd::BlockQuote(_)) => {
                self.finish();
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }

            Event::Start(Tag::CodeBlock(kind)) => {
                let language = match &kind {
                    CodeBlockKind::Fenced(info) => info.split_whitespace().next(),
                    CodeBlockKind::Indented => None,
                };
                self.begin(Pending::Code(
                    language.unwrap_or(DEFAULT_CODE_LANGUAGE).to_string(),
                ));
            }
            Event::End(TagEnd::CodeBlock) => self.finish(),

            Event::Start(Tag::HtmlBlock) => self.begin(self.paragraph_kind()),
            Event::End(TagEnd::HtmlBlock) => self.finish(),

            Event::Rule => {
                self.finish();
                self.blocks.push(Block::divider());
            }

            Event::Start(Tag::Emphasis) | Event::End(TagEnd::Emphasis) => self.push_text("*"),
            Event::Start(Tag::Strong) | Event::End(TagEnd::Strong) => self.push_text("**"),
            Event::Start(Tag::Strikethrough) | Event::End(TagEnd::Strikethrough) => {
                self.push_text("~~")
            }
            Event::Start(Tag::Link { dest_url, .. }) => {
                self.links.push(dest_url.to_string());
                self.push_text("[");
            }
            Event::Start(Tag::Image { dest_url, .. }) => {
                self.links.push(dest_url.to_string());
                self.push_text("![");
            }
            Event::End(TagEnd::Link) | Event::End(TagEnd::Image) => {
                let url = self.links.pop().unwrap_or_default();
                self.push_text(&format!("]({url})"));
            }
            Event::Code(code) => self.push_text(&format!("`{code}`")),

            Event::Text(text) | Event::Html(text) | Event::InlineHtml(text) => self.push_text(&text),
            Event::SoftBreak | Event::HardBreak => self.push_text("\n"),

            _ => {}
        }
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

pub fn to_blocks(text: &str) -> Vec<Block> {
    let options = Options::ENABLE_TASKLISTS | Options::ENABLE_STRIKETHROUGH;
    let mut builder = BlockBuilder::default();
    for event in Parser::new_ext(text, options) {
        builder.event(event);
    }
    builder.finish();
    builder.blocks
}

/// Which consecutive blocks render without a blank line between them.
fn list_family(kind: &str) -> Option<&'static str> {
    match kind {
        "bulleted_list_item" | "to_do" => Some("bulleted"),
        "numbered_list_item" => Some("numbered"),
        _ => None,
    }
}

pub fn to_markdown(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut previous_family: Option<&str> = None;
    let mut number = 0;

    for block in blocks {
        if block.is_container() {
            continue;
        }
        let family = list_family(&block.kind);
        if family != Some("numbered") {
            number = 0;
        }

        let rendered = match block.kind.as_str() {
            "paragraph" => block.plain_text(),
            "heading_1" => format!("# {}", block.plain_text()),
            "heading_2" => format!("## {}", block.plain_text()),
            "heading_3" => format!("### {}", block.plain_text()),
            "bulleted_list_item" => format!("- {}", block.plain_text()),
            "numbered_list_item" => {
                number += 1;
                format!("{number}. {}", block.plain_text())
            }
            "to_do" => {
                let checked = block
                    .payload
                    .get("checked")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                let mark = if checked { "x" } else { " " };
                format!("- [{mark}] {}", block.plain_text())
            }
            "quote" => block
                .plain_text()
                .lines()
                .map(|line| format!("> {line}"))
                .collect::<Vec<_>>()
                .join("\n"),
            "code" => {
                let language = block
                    .payload
                    .get("language")
                    .and_then(serde_json::Value::as_str)
                    .filter(|language| *language != DEFAULT_CODE_LANGUAGE)
                    .unwrap_or("");
                format!("```{language}\n{}\n```", block.plain_text())
            }
            "divider" => "---".to_string(),
            _ => block.plain_text(),
        };
        if rendered.is_empty() && block.kind != "paragraph" {
            continue;
        }

        if !out.is_empty() {
            let same_list = family.is_some() && family == previous_family;
            out.push_str(if same_list { "\n" } else { "\n\n" });
        }
        out.push_str(&rendered);
        previous_family = family;
    }

    if !out.is_empty() {
        out.push('\n');
    }
    out
}
