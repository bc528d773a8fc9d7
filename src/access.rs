use crate::mail::{Mailer, Message};
use crate::{SITE_NAME, SITE_URL};
use actix::prelude::*;
use actix_broker::BrokerSubscribe;
use gifts_types::access::service::VerificationRequested;
use log_error::*;
use std::sync::Arc;

pub mod repository;

/// Sends the verification link whenever a company asks for one
pub struct AccountMailer {
    mailer: Arc<dyn Mailer>,
}

impl AccountMailer {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

impl Actor for AccountMailer {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.subscribe_system_async::<VerificationRequested>(ctx);
    }
}

pub fn verification_link(token: &str) -> String {
    format!("{}/accounts/verify/{token}", SITE_URL.as_str())
}

pub fn verification_message(event: &VerificationRequested) -> Message {
    let subject = match event.resend {
        true => format!("Повторное подтверждение регистрации на {}", SITE_NAME.as_str()),
        false => format!("Подтверждение регистрации на {}", SITE_NAME.as_str()),
    };
    let body = format!(
        "Здравствуйте, {}!\n\n\
         Для подтверждения регистрации компании «{}» перейдите по ссылке:\n{}\n\n\
         Ссылка действительна в течение 5 минут.\n\n\
         Если вы не регистрировались на сайте, просто проигнорируйте это письмо.",
        event.user.full_name(),
        event.company.legal_name,
        verification_link(&event.token.0),
    );
    Message::new(subject, body, vec![event.company.email.clone()])
}

impl Handler<VerificationRequested> for AccountMailer {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, event: VerificationRequested, _: &mut Self::Context) -> Self::Result {
        let mailer = self.mailer.clone();
        let message = verification_message(&event);
        Box::pin(
            async move {
                mailer
                    .send(message)
                    .await
                    .log_error("Unable to send verification email");
            }
            .into_actor(self),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::repository::{
        SqliteAuditLogRepository, SqliteCompanyRepository, SqliteUserRepository,
    };
    use crate::mail::tests::MemoryMailer;
    use gifts_types::access::service::{
        CompanyService, Login, Register, Registration, Resend, Verify,
    };
    use gifts_types::access::service::{RegistrationError, VerificationError};
    use gifts_types::access::{UserRole, VerificationToken};
    use std::time::Duration;
    use tokio_rusqlite::Connection;

    fn registration(email: &str) -> Registration {
        Registration {
            email: email.to_string(),
            inn: "7707083893".to_string(),
            legal_name: "ООО Ромашка".to_string(),
            password: "very secret".to_string(),
            role: UserRole::Admin,
            first_name: "Иван".to_string(),
            last_name: "Петров".to_string(),
            middle_name: None,
            organization_type: Default::default(),
            company_status: Default::default(),
            kpp: None,
            legal_address: None,
            bank_account: None,
            bank_bik: None,
        }
    }

    async fn wait_for_mail(mailer: &MemoryMailer, count: usize) {
        for _ in 0..100 {
            if mailer.sent.lock().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[actix_web::test]
    async fn registers_and_verifies_company() {
        let conn = Connection::open_in_memory().await.unwrap();
        let companies = Arc::new(SqliteCompanyRepository::init(conn.clone()).await.unwrap());
        let users = Arc::new(SqliteUserRepository::init(conn.clone()).await.unwrap());
        let audit = Arc::new(SqliteAuditLogRepository::init(conn).await.unwrap());
        let mailer = Arc::new(MemoryMailer::default());
        AccountMailer::new(mailer.clone()).start();
        let service = CompanyService::new(companies, users, audit).start();

        let res = service
            .send(Register(Registration {
                inn: "123".to_string(),
                ..registration("a@romashka.ru")
            }))
            .await
            .unwrap();
        assert!(matches!(res, Err(RegistrationError::InvalidInn)));

        let (company, user) = service
            .send(Register(registration("A@Romashka.ru ")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(company.email, "a@romashka.ru");
        assert!(!user.is_active);
        let duplicate = service
            .send(Register(registration("a@romashka.ru")))
            .await
            .unwrap();
        assert!(matches!(duplicate, Err(RegistrationError::EmailTaken)));

        let refused = service
            .send(Login {
                email: "a@romashka.ru".to_string(),
                password: "very secret".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert!(refused.is_none());

        wait_for_mail(&mailer, 1).await;
        let token = {
            let sent = mailer.sent.lock().await;
            assert_eq!(sent[0].to, vec!["a@romashka.ru".to_string()]);
            assert!(sent[0].body.contains("5 минут"));
            assert!(!sent[0].body.contains("very secret"));
            company.verification_token.clone().unwrap()
        };
        assert!(mailer.sent.lock().await[0].body.contains(&token.0));

        service.send(Resend(company.id)).await.unwrap().unwrap();
        wait_for_mail(&mailer, 2).await;
        let stale = service.send(Verify(token)).await.unwrap();
        assert!(matches!(stale, Err(VerificationError::Invalid)));

        let body = mailer.sent.lock().await[1].body.clone();
        let fresh = body
            .split("/accounts/verify/")
            .nth(1)
            .and_then(|s| s.split_whitespace().next())
            .unwrap()
            .to_string();
        let verified = service
            .send(Verify(VerificationToken(fresh)))
            .await
            .unwrap()
            .unwrap();
        assert!(verified.is_active);
        let logged_in = service
            .send(Login {
                email: "a@romashka.ru".to_string(),
                password: "very secret".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(logged_in.map(|u| u.id), Some(user.id));
    }
}
