//! Invitation email rendering.
//!
//! Recognized placeholders: `{{name}}`, `{{questionTitle}}`, `{{questionId}}`,
//! `{{inviteLink}}`, `{{platformUrl}}`. Unknown tokens are left as written.

use crate::models::invite::InvitationJob;

/// Template used when a question has no custom subject/body.
pub const DEFAULT_TEMPLATE: &str = "question-invite";

struct EmailTemplate {
    name: &'static str,
    subject: &'static str,
    html: &'static str,
}

const TEMPLATES: &[EmailTemplate] = &[EmailTemplate {
    name: DEFAULT_TEMPLATE,
    subject: "You're invited to weigh in on \"{{questionTitle}}\"",
    html: r#"<p>Hi {{name}},</p>
<p>You have been invited to share your perspective on <strong>{{questionTitle}}</strong> on Vayam.</p>
<p><a href="{{inviteLink}}">Create your account</a> to read the proposed solutions, vote and add your arguments.</p>
<p style="color:#6b7280;font-size:12px">Question reference: {{questionId}} &middot; <a href="{{platformUrl}}">{{platformUrl}}</a></p>"#,
}];

/// Values substituted into a template.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub name: String,
    pub question_title: String,
    pub question_id: String,
    pub invite_link: String,
    pub platform_url: String,
}

impl TemplateVars {
    pub fn for_job(job: &InvitationJob, platform_url: &str) -> Self {
        Self {
            name: job.recipient_name.clone(),
            question_title: job.question_title.clone(),
            question_id: job.question_id.to_string(),
            invite_link: job.invite_link.clone(),
            platform_url: platform_url.to_string(),
        }
    }

    fn lookup(&self, token: &str) -> Option<&str> {
        match token {
            "name" => Some(self.name.as_str()),
            "questionTitle" => Some(self.question_title.as_str()),
            "questionId" => Some(self.question_id.as_str()),
            "inviteLink" => Some(self.invite_link.as_str()),
            "platformUrl" => Some(self.platform_url.as_str()),
            _ => None,
        }
    }

    fn escaped(&self) -> Self {
        Self {
            name: escape_html(&self.name),
            question_title: escape_html(&self.question_title),
            question_id: escape_html(&self.question_id),
            invite_link: escape_html(&self.invite_link),
            platform_url: escape_html(&self.platform_url),
        }
    }
}

/// Subject and HTML body ready to hand to a mailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Replace every known placeholder in one left-to-right pass. Substituted
/// values are not rescanned.
pub fn substitute(text: &str, vars: &TemplateVars) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let token = &after_open[..end];
                match vars.lookup(token.trim()) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(token);
                        out.push_str("}}");
                    }
                }
                rest = &after_open[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render an invitation, preferring the question's custom subject/body.
pub fn render_invite(job: &InvitationJob, platform_url: &str) -> RenderedEmail {
    let vars = TemplateVars::for_job(job, platform_url);
    let default = default_template();

    let subject = match job.custom_subject.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(custom) => substitute(custom, &vars),
        None => substitute(default.subject, &vars),
    };

    let html = match job.custom_body.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(custom) => plain_to_html(&substitute(custom, &vars)),
        None => substitute(default.html, &vars.escaped()),
    };

    RenderedEmail { subject, html }
}

fn default_template() -> &'static EmailTemplate {
    TEMPLATES
        .iter()
        .find(|t| t.name == DEFAULT_TEMPLATE)
        .unwrap_or(&TEMPLATES[0])
}

fn plain_to_html(text: &str) -> String {
    escape_html(text)
        .split("\n\n")
        .map(|para| format!("<p>{}</p>", para.replace('\n', "<br>")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
