//! Chat transport boundary.
//!
//! The transport adapter hands the daemon one inbound message as JSON and
//! relays the JSON reply. A reply to an earlier face offer carries the echoed
//! reply-context token in `reply_to.context`.

use crate::tagger::{TagError, Tagger};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

const USAGE: &str = "I help put names to faces.\n\
    /getface - show a face nobody has named yet; reply to it with a name\n\
    /find <name> - show every photo with that person\n\
    /help - this message";

const HINT: &str = "I didn't get that. Send /getface to name a face or /find <name> to search.";

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("bad request: empty message")]
    Empty,
    #[error("bad request: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub text: String,
    /// Present when the user replied to an earlier outbound message.
    #[serde(default)]
    pub reply_to: Option<RepliedMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepliedMessage {
    /// Token attached to the message being replied to, echoed back verbatim.
    #[serde(default)]
    pub context: Option<String>,
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        if raw.trim().is_empty() {
            return Err(ChatError::Empty);
        }
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundReply {
    Text {
        text: String,
    },
    /// A single image; `context` must be attached so replies can be correlated.
    Photo {
        url: String,
        caption: String,
        context: String,
    },
    MediaGroup {
        caption: String,
        urls: Vec<String>,
    },
}

impl OutboundReply {
    fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

type Handler = fn(&Tagger, &str) -> OutboundReply;

/// Immutable command table, built once at startup.
pub struct Dispatcher {
    slash: HashMap<&'static str, Handler>,
    words: HashMap<&'static str, Handler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let slash: HashMap<&'static str, Handler> = HashMap::from([
            ("/getface", offer_face as Handler),
            ("/find", find_photos as Handler),
            ("/start", usage as Handler),
            ("/help", usage as Handler),
        ]);
        let words: HashMap<&'static str, Handler> = HashMap::from([
            ("get-next-unnamed-face", offer_face as Handler),
            ("find", find_photos as Handler),
            ("help", usage as Handler),
        ]);
        Self { slash, words }
    }

    /// Route one message.
    ///
    /// Slash commands win; otherwise a reply names the face it replies to;
    /// otherwise a bare command word; otherwise a hint.
    pub fn dispatch(&self, tagger: &Tagger, message: &InboundMessage) -> OutboundReply {
        let text = message.text.trim();
        let (word, rest) = match text.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (text, ""),
        };

        if word.starts_with('/') {
            // Group chats address commands as `/find@SomeBot`.
            let command = word.split('@').next().unwrap_or(word).to_lowercase();
            return match self.slash.get(command.as_str()) {
                Some(handler) => handler(tagger, rest),
                None => OutboundReply::text(HINT),
            };
        }

        if let Some(reply) = &message.reply_to {
            return name_face(tagger, reply.context.as_deref(), text);
        }

        match self.words.get(word.to_lowercase().as_str()) {
            Some(handler) => handler(tagger, rest),
            None => OutboundReply::text(HINT),
        }
    }
}

fn failure(error: TagError) -> OutboundReply {
    if error.is_user_error() {
        tracing::info!(error = %error, "chat: rejected request");
    } else {
        tracing::error!(error = %error, "chat: request failed");
    }
    OutboundReply::text(error.user_message())
}

fn offer_face(tagger: &Tagger, _args: &str) -> OutboundReply {
    match tagger.next_unnamed_face() {
        Ok(Some(face)) => OutboundReply::Photo {
            url: face.display_url,
            caption: "Who is this? Reply to this photo with their name.".into(),
            context: face.context.encode(),
        },
        Ok(None) => OutboundReply::text("Every face has a name. Upload more photos!"),
        Err(e) => failure(e),
    }
}

fn find_photos(tagger: &Tagger, name: &str) -> OutboundReply {
    match tagger.find_photos_by_name(name) {
        Ok(ids) if ids.is_empty() => OutboundReply::text(format!("No photos of {name} yet.")),
        Ok(ids) => OutboundReply::MediaGroup {
            caption: format!("Photos of {name}"),
            urls: ids.iter().map(|id| tagger.links().photo_url(id)).collect(),
        },
        Err(e) => failure(e),
    }
}

fn name_face(tagger: &Tagger, context: Option<&str>, name: &str) -> OutboundReply {
    match tagger.assign_name_from_echo(context, name) {
        Ok(record) => {
            let name = record.face_name.as_deref().unwrap_or(name);
            OutboundReply::text(format!("Got it, that's {name}."))
        }
        Err(e) => failure(e),
    }
}

fn usage(_tagger: &Tagger, _args: &str) -> OutboundReply {
    OutboundReply::text(USAGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagger::tests::{fixture, id, tagger};

    fn say(text: &str) -> InboundMessage {
        InboundMessage {
            text: text.into(),
            reply_to: None,
        }
    }

    fn reply(text: &str, context: Option<&str>) -> InboundMessage {
        InboundMessage {
            text: text.into(),
            reply_to: Some(RepliedMessage {
                context: context.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_parse_inbound() {
        let raw = r#"{"text":"Bob","reply_to":{"context":"face:f1"}}"#;
        let m = InboundMessage::parse(raw).unwrap();
        assert_eq!(m, reply("Bob", Some("face:f1")));
        assert!(matches!(InboundMessage::parse("  "), Err(ChatError::Empty)));
        assert!(matches!(InboundMessage::parse("{oops"), Err(ChatError::Invalid(_))));
    }

    #[test]
    fn test_reply_wire_form() {
        let json = serde_json::to_value(OutboundReply::Photo {
            url: "u".into(),
            caption: "c".into(),
            context: "face:f1".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "photo", "url": "u", "caption": "c", "context": "face:f1"})
        );
    }

    #[test]
    fn test_getface_and_alias() {
        let f = fixture();
        f.faces.insert_unnamed(&id("f1"), "P1").unwrap();
        let t = tagger(&f, Some("api.example.net"));
        let d = Dispatcher::new();
        for text in ["/getface", "get-next-unnamed-face", "/GetFace@FaceBot"] {
            assert_eq!(
                d.dispatch(&t, &say(text)),
                OutboundReply::Photo {
                    url: "https://api.example.net/?face=f1.jpg".into(),
                    caption: "Who is this? Reply to this photo with their name.".into(),
                    context: "face:f1".into(),
                }
            );
        }
    }

    #[test]
    fn test_getface_when_all_named() {
        let f = fixture();
        let reply = Dispatcher::new().dispatch(&tagger(&f, None), &say("/getface"));
        assert!(matches!(reply, OutboundReply::Text { .. }));
    }

    #[test]
    fn test_reply_names_face() {
        let f = fixture();
        f.faces.insert_unnamed(&id("f1"), "P1").unwrap();
        let t = tagger(&f, None);
        let out = Dispatcher::new().dispatch(&t, &reply(" Bob ", Some("face:f1")));
        assert_eq!(out, OutboundReply::text("Got it, that's Bob."));
        assert_eq!(f.faces.get(&id("f1")).unwrap().unwrap().face_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn test_reply_without_context_is_user_error() {
        let f = fixture();
        f.faces.insert_unnamed(&id("f1"), "P1").unwrap();
        let t = tagger(&f, None);
        let d = Dispatcher::new();
        for message in [
            reply("Bob", None),
            reply("Bob", Some("face:")),
            reply("", Some("face:f1")),
        ] {
            let OutboundReply::Text { text } = d.dispatch(&t, &message) else {
                panic!("expected a text reply");
            };
            assert!(!text.contains("error"));
        }
        assert_eq!(f.faces.stats().unwrap().unnamed, 1);
    }

    #[test]
    fn test_find_media_group_and_empty() {
        let f = fixture();
        f.faces.insert_unnamed(&id("f1"), "P1").unwrap();
        f.faces.insert_unnamed(&id("f2"), "P2").unwrap();
        f.faces.assign_name(&id("f1"), "Mary Ann").unwrap();
        f.faces.assign_name(&id("f2"), "Mary Ann").unwrap();
        let t = tagger(&f, None);
        let d = Dispatcher::new();

        assert_eq!(
            d.dispatch(&t, &say("/find Mary Ann")),
            OutboundReply::MediaGroup {
                caption: "Photos of Mary Ann".into(),
                urls: vec!["facetag://photos/P1".into(), "facetag://photos/P2".into()],
            }
        );
        assert_eq!(d.dispatch(&t, &say("find Mary Ann")), d.dispatch(&t, &say("/find Mary Ann")));
        assert_eq!(
            d.dispatch(&t, &say("find Carol")),
            OutboundReply::text("No photos of Carol yet.")
        );
        assert_eq!(
            d.dispatch(&t, &say("/find")),
            OutboundReply::text(TagError::EmptyQuery.user_message())
        );
    }

    #[test]
    fn test_slash_command_beats_reply() {
        let f = fixture();
        f.faces.insert_unnamed(&id("f1"), "P1").unwrap();
        let t = tagger(&f, None);
        let out = Dispatcher::new().dispatch(&t, &reply("/help", Some("face:f1")));
        assert_eq!(out, OutboundReply::text(USAGE));
        assert_eq!(f.faces.stats().unwrap().unnamed, 1);
    }

    #[test]
    fn test_unknown_input_gets_hint() {
        let f = fixture();
        let t = tagger(&f, None);
        let d = Dispatcher::new();
        assert_eq!(d.dispatch(&t, &say("hello there")), OutboundReply::text(HINT));
        assert_eq!(d.dispatch(&t, &say("/nope")), OutboundReply::text(HINT));
        assert_eq!(d.dispatch(&t, &say("/start")), OutboundReply::text(USAGE));
    }
}
