use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::HubResult;

/// Decrypted inbound callback message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReceiveMessage {
    #[serde(rename = "ToUserName")]
    pub to_user_name: String,
    #[serde(rename = "FromUserName")]
    pub from_user_name: String,
    #[serde(rename = "CreateTime", default)]
    pub create_time: i64,
    #[serde(rename = "MsgType")]
    pub msg_type: String,
    #[serde(rename = "Content", default)]
    pub content: String,
    #[serde(rename = "MsgId", default)]
    pub msg_id: Option<String>,
    #[serde(rename = "AgentID")]
    pub agent_id: u64,
}

impl ReceiveMessage {
    pub fn from_xml(xml: &str) -> HubResult<Self> {
        Ok(quick_xml::de::from_str(xml)?)
    }

    pub fn is_text(&self) -> bool {
        self.msg_type.eq_ignore_ascii_case("text")
    }
}

/// Synchronous text reply sealed into the HTTP response body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceReply {
    #[serde(rename = "ToUserName")]
    pub to_user_name: String,
    #[serde(rename = "FromUserName")]
    pub from_user_name: String,
    #[serde(rename = "CreateTime")]
    pub create_time: i64,
    #[serde(rename = "MsgType")]
    pub msg_type: String,
    #[serde(rename = "Content")]
    pub content: String,
}

impl InstanceReply {
    /// Build a reply to `inbound`: sender and recipient swap places.
    pub fn text_to(inbound: &ReceiveMessage, content: impl Into<String>) -> Self {
        Self {
            to_user_name: inbound.from_user_name.clone(),
            from_user_name: inbound.to_user_name.clone(),
            create_time: chrono::Utc::now().timestamp(),
            msg_type: "text".to_string(),
            content: content.into(),
        }
    }

    pub fn to_xml(&self) -> String {
        format!(
            "<xml><ToUserName>{}</ToUserName><FromUserName>{}</FromUserName><CreateTime>{}</CreateTime><MsgType>{}</MsgType><Content>{}</Content></xml>",
            cdata(&self.to_user_name),
            cdata(&self.from_user_name),
            self.create_time,
            cdata(&self.msg_type),
            cdata(&self.content)
        )
    }

    pub fn from_xml(xml: &str) -> HubResult<Self> {
        Ok(quick_xml::de::from_str(xml)?)
    }
}

fn cdata(value: &str) -> String {
    // A literal "]]>" would end the section early; split it across two.
    format!("<![CDATA[{}]]>", value.replace("]]>", "]]]]><![CDATA[>"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBody {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextCardBody {
    pub title: String,
    pub description: String,
    pub url: String,
    #[serde(rename = "btntxt")]
    pub button_text: String,
}

/// Proactive message pushed through the provider's send API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularMessage {
    /// Recipient user ids joined by `|`, or `@all`
    #[serde(rename = "touser")]
    pub to_user: String,
    #[serde(rename = "agentid")]
    pub agent_id: u64,
    #[serde(rename = "msgtype")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<TextBody>,
    #[serde(rename = "textcard", default, skip_serializing_if = "Option::is_none")]
    pub text_card: Option<TextCardBody>,
}

impl RegularMessage {
    pub fn text(agent_id: u64, to_user: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            to_user: to_user.into(),
            agent_id,
            msg_type: "text".to_string(),
            text: Some(TextBody {
                content: content.into(),
            }),
            text_card: None,
        }
    }

    pub fn text_card(
        agent_id: u64,
        to_user: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        url: impl Into<String>,
        button_text: impl Into<String>,
    ) -> Self {
        Self {
            to_user: to_user.into(),
            agent_id,
            msg_type: "textcard".to_string(),
            text: None,
            text_card: Some(TextCardBody {
                title: title.into(),
                description: description.into(),
                url: url.into(),
                button_text: button_text.into(),
            }),
        }
    }

    /// Human readable body, for logs and tests.
    pub fn body(&self) -> &str {
        match (&self.text, &self.text_card) {
            (Some(text), _) => &text.content,
            (None, Some(card)) => &card.description,
            (None, None) => "",
        }
    }
}

pub fn join_recipients<I, S>(ids: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    ids.into_iter().map(|s| s.as_ref().to_string()).join("|")
}
