use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::path::PathBuf;
use time::macros::format_description;
use time::OffsetDateTime;
use uuid::Uuid;

pub static DEFAULT_FROM_EMAIL: Lazy<String> =
    Lazy::new(|| envmnt::get_or("DEFAULT_FROM_EMAIL", "noreply@localhost"));

#[derive(Debug, Clone, PartialEq)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: mime::Mime,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub body: String,
    pub to: Vec<String>,
    pub reply_to: Option<String>,
    pub attachments: Vec<MailAttachment>,
}

impl Message {
    pub fn new(subject: impl Into<String>, body: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            to,
            reply_to: None,
            attachments: vec![],
        }
    }

    pub fn with_attachment(mut self, attachment: MailAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: Message) -> anyhow::Result<()>;
}

/// Drops every message into its own directory under `root`; an external relay delivers them
pub struct OutboxMailer {
    root: PathBuf,
    from: String,
}

impl OutboxMailer {
    pub fn new(root: PathBuf, from: String) -> Self {
        Self { root, from }
    }

    pub fn from_env() -> Self {
        Self::new(
            PathBuf::from(envmnt::get_or("MAIL_OUTBOX", "outbox")),
            DEFAULT_FROM_EMAIL.clone(),
        )
    }

    fn render(&self, message: &Message) -> String {
        let mut res = format!("From: {}\nTo: {}\n", self.from, message.to.join(", "));
        if let Some(reply_to) = &message.reply_to {
            res.push_str(&format!("Reply-To: {reply_to}\n"));
        }
        res.push_str(&format!("Subject: {}\n", message.subject));
        for a in &message.attachments {
            res.push_str(&format!("Attachment: {} ({})\n", a.filename, a.content_type));
        }
        res.push('\n');
        res.push_str(&message.body);
        res
    }
}

fn safe_filename(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match name.trim_matches('.') {
        "" => "attachment".to_string(),
        s => s.to_string(),
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send(&self, message: Message) -> anyhow::Result<()> {
        if message.to.is_empty() {
            return Err(anyhow::anyhow!("Message \"{}\" has no recipients", message.subject));
        }
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!("[year][month][day][hour][minute][second]"))?;
        let dir = self.root.join(format!("{stamp}-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Unable to create outbox entry {}", dir.display()))?;
        tokio::fs::write(dir.join("message.txt"), self.render(&message)).await?;
        for a in &message.attachments {
            tokio::fs::write(dir.join(safe_filename(&a.filename)), &a.data).await?;
        }
        log::info!(
            "Mail \"{}\" to {} queued in {}",
            message.subject,
            message.to.join(", "),
            dir.display()
        );
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryMailer {
        pub sent: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Mailer for MemoryMailer {
        async fn send(&self, message: Message) -> anyhow::Result<()> {
            self.sent.lock().await.push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_message_to_outbox() {
        let root = std::env::temp_dir().join(format!("outbox-{}", Uuid::new_v4()));
        let mailer = OutboxMailer::new(root.clone(), "shop@example.com".to_string());
        let message = Message::new("Счет", "Тело письма", vec!["a@b.ru".to_string()])
            .with_attachment(MailAttachment {
                filename: "Счет_1.pdf".to_string(),
                content_type: mime::APPLICATION_PDF,
                data: b"%PDF".to_vec(),
            });
        mailer.send(message).await.unwrap();

        let mut entries = std::fs::read_dir(&root).unwrap();
        let dir = entries.next().unwrap().unwrap().path();
        let text = std::fs::read_to_string(dir.join("message.txt")).unwrap();
        assert!(text.starts_with("From: shop@example.com\nTo: a@b.ru\n"));
        assert!(text.contains("Subject: Счет\n"));
        assert!(text.ends_with("\n\nТело письма"));
        assert_eq!(std::fs::read(dir.join("Счет_1.pdf")).unwrap(), b"%PDF");
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn refuses_message_without_recipients() {
        let root = std::env::temp_dir().join(format!("outbox-{}", Uuid::new_v4()));
        let mailer = OutboxMailer::new(root, "shop@example.com".to_string());
        assert!(mailer.send(Message::new("x", "y", vec![])).await.is_err());
    }

    #[test]
    fn cleans_attachment_names() {
        assert_eq!(safe_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(safe_filename(".."), "attachment");
    }
}
