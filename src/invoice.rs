use crate::mail::{MailAttachment, Mailer, Message};
use crate::order::{Order, OrderStatus, OrderStatusChanged};
use crate::{moscow_now, SITE_NAME};
use actix::prelude::*;
use actix_broker::BrokerSubscribe;
use anyhow::{anyhow, Context as _};
use askama::Template;
use async_trait::async_trait;
use derive_builder::Builder;
use gifts_types::access::repository::{CompanyRepository, UserRepository};
use gifts_types::access::{Company, OrganizationType};
use log_error::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_xlsxwriter::{Format, FormatAlign, Workbook};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;
use time_tz::OffsetDateTimeExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use typesafe_repository::async_ops::Get;

const WKHTMLTOPDF_LOCATIONS: &[&str] = &[
    "/usr/local/bin/wkhtmltopdf",
    "/usr/bin/wkhtmltopdf",
    "/opt/homebrew/bin/wkhtmltopdf",
    "C:\\Program Files\\wkhtmltopdf\\bin\\wkhtmltopdf.exe",
];

pub fn invoice_number(order_id: i64, date: OffsetDateTime) -> String {
    let date = date.to_timezone(time_tz::timezones::db::europe::MOSCOW);
    format!("INV-{}-{order_id:06}", date.year())
}

pub fn format_money(d: Decimal) -> String {
    format!("{:.2}", d.round_dp(2))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Payer {
    pub legal_name: String,
    pub organization_type: OrganizationType,
    pub inn: String,
    pub kpp: Option<String>,
    pub legal_address: Option<String>,
    pub bank_account: Option<String>,
    pub bank_bik: Option<String>,
}

impl From<Company> for Payer {
    fn from(c: Company) -> Self {
        Self {
            legal_name: c.legal_name,
            organization_type: c.organization_type,
            inn: c.inn,
            kpp: c.kpp,
            legal_address: c.legal_address,
            bank_account: c.bank_account,
            bank_bik: c.bank_bik,
        }
    }
}

#[derive(Debug, Clone, Builder)]
pub struct Invoice {
    pub order: Order,
    #[builder(default)]
    pub payer: Option<Payer>,
    #[builder(default = "SITE_NAME.clone()")]
    pub seller: String,
    #[builder(default = "moscow_now()")]
    pub date: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceLine {
    pub index: usize,
    pub name: String,
    pub size: String,
    pub quantity: u32,
    pub price: String,
    pub total: String,
}

impl Invoice {
    pub fn number(&self) -> String {
        invoice_number(self.order.id, self.date)
    }

    pub fn date_string(&self) -> String {
        self.date
            .to_timezone(time_tz::timezones::db::europe::MOSCOW)
            .format(format_description!("[day].[month].[year]"))
            .unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<InvoiceLine> {
        self.order
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| InvoiceLine {
                index: i + 1,
                name: item.product_name.clone(),
                size: item.size.clone().unwrap_or_default(),
                quantity: item.quantity,
                price: format_money(item.price),
                total: format_money(item.total()),
            })
            .collect()
    }

    pub fn render_html(&self) -> anyhow::Result<String> {
        let page = InvoicePage {
            number: self.number(),
            date: self.date_string(),
            order_id: self.order.id,
            seller: self.seller.clone(),
            payer: self.payer.clone(),
            customer: self.order.customer_name(),
            email: self.order.email.clone(),
            phone: self.order.phone.clone(),
            address: self.order.address.clone(),
            lines: self.lines(),
            total_quantity: self.order.total_quantity(),
            total: format_money(self.order.total()),
        };
        page.render().map_err(|err| anyhow!("Unable to render invoice: {err}"))
    }

    pub fn render_xlsx(&self) -> anyhow::Result<Vec<u8>> {
        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();
        let money = Format::new()
            .set_num_format("#,##0.00")
            .set_align(FormatAlign::Right);
        let bold_money = money.clone().set_bold();
        let sheet = workbook.add_worksheet();
        sheet.set_name("Счет")?;
        sheet.set_column_width(0, 6.)?;
        sheet.set_column_width(1, 50.)?;
        sheet.set_column_width(2, 10.)?;
        sheet.set_column_width(3, 10.)?;
        sheet.set_column_width(4, 14.)?;
        sheet.set_column_width(5, 14.)?;

        sheet.write_string_with_format(
            0,
            0,
            format!("Счет на оплату № {} от {}", self.number(), self.date_string()),
            &bold,
        )?;
        sheet.write_string(1, 0, format!("Поставщик: {}", self.seller))?;
        let payer = match &self.payer {
            Some(p) => format!("Покупатель: {} «{}», ИНН {}", p.organization_type, p.legal_name, p.inn),
            None => format!("Покупатель: {}", self.order.customer_name()),
        };
        sheet.write_string(2, 0, payer)?;

        let header = 4;
        for (col, title) in ["№", "Товар", "Размер", "Кол-во", "Цена", "Сумма"]
            .into_iter()
            .enumerate()
        {
            sheet.write_string_with_format(header, col as u16, title, &bold)?;
        }
        let mut row = header + 1;
        for (i, item) in self.order.items.iter().enumerate() {
            sheet.write_number(row, 0, (i + 1) as f64)?;
            sheet.write_string(row, 1, &item.product_name)?;
            sheet.write_string(row, 2, item.size.as_deref().unwrap_or_default())?;
            sheet.write_number(row, 3, item.quantity as f64)?;
            sheet.write_number_with_format(row, 4, to_f64(item.price), &money)?;
            sheet.write_number_with_format(row, 5, to_f64(item.total()), &money)?;
            row += 1;
        }
        sheet.write_string_with_format(row, 1, "Итого", &bold)?;
        sheet.write_number_with_format(row, 3, self.order.total_quantity() as f64, &bold)?;
        sheet.write_number_with_format(row, 5, to_f64(self.order.total()), &bold_money)?;
        Ok(workbook.save_to_buffer()?)
    }

    pub fn pdf_filename(&self) -> String {
        format!("Счет_{}.pdf", self.order.id)
    }

    pub fn xlsx_filename(&self) -> String {
        format!("Счет_{}.xlsx", self.order.id)
    }
}

fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or_default()
}

#[derive(Template)]
#[template(path = "invoice.html")]
struct InvoicePage {
    number: String,
    date: String,
    order_id: i64,
    seller: String,
    payer: Option<Payer>,
    customer: String,
    email: String,
    phone: String,
    address: String,
    lines: Vec<InvoiceLine>,
    total_quantity: u64,
    total: String,
}

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, html: &str) -> anyhow::Result<Vec<u8>>;
}

pub struct Wkhtmltopdf {
    path: PathBuf,
}

impl Wkhtmltopdf {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Uses `WKHTMLTOPDF_PATH` or the first standard install location that exists
    pub fn locate() -> Option<Self> {
        if let Ok(path) = std::env::var("WKHTMLTOPDF_PATH") {
            return Some(Self::new(path.into()));
        }
        WKHTMLTOPDF_LOCATIONS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .map(Self::new)
    }
}

#[async_trait]
impl PdfRenderer for Wkhtmltopdf {
    async fn render(&self, html: &str) -> anyhow::Result<Vec<u8>> {
        let mut child = Command::new(&self.path)
            .args([
                "--quiet",
                "--encoding",
                "UTF-8",
                "--page-size",
                "A4",
                "--margin-top",
                "15mm",
                "--margin-right",
                "15mm",
                "--margin-bottom",
                "15mm",
                "--margin-left",
                "15mm",
                "--footer-center",
                "[page]/[topage]",
                "--footer-font-size",
                "8",
                "-",
                "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Unable to start {}", self.path.display()))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("wkhtmltopdf stdin is not captured"))?;
        let input = html.as_bytes().to_vec();
        let write = async move {
            let res = stdin.write_all(&input).await;
            drop(stdin);
            res
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output?;
        written?;
        if !output.status.success() {
            return Err(anyhow!(
                "wkhtmltopdf exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(output.stdout)
    }
}

struct MissingRenderer;

#[async_trait]
impl PdfRenderer for MissingRenderer {
    async fn render(&self, _: &str) -> anyhow::Result<Vec<u8>> {
        Err(anyhow!(
            "wkhtmltopdf not found, set WKHTMLTOPDF_PATH to enable PDF invoices"
        ))
    }
}

pub fn pdf_renderer_from_env() -> Arc<dyn PdfRenderer> {
    match Wkhtmltopdf::locate() {
        Some(w) => {
            log::info!("Rendering PDF invoices with {}", w.path.display());
            Arc::new(w)
        }
        None => {
            log::warn!("wkhtmltopdf not found, PDF invoices are disabled");
            Arc::new(MissingRenderer)
        }
    }
}

/// Looks up payer details for orders placed by company users
#[derive(Clone)]
pub struct Invoices {
    users: Arc<dyn UserRepository>,
    companies: Arc<dyn CompanyRepository>,
}

impl Invoices {
    pub fn new(users: Arc<dyn UserRepository>, companies: Arc<dyn CompanyRepository>) -> Self {
        Self { users, companies }
    }

    pub async fn payer(&self, order: &Order) -> anyhow::Result<Option<Payer>> {
        let Some(user_id) = order.user_id() else {
            return Ok(None);
        };
        let Some(company_id) = self
            .users
            .get_one(&user_id)
            .await?
            .and_then(|u| u.company_id)
        else {
            return Ok(None);
        };
        Ok(self.companies.get_one(&company_id).await?.map(Payer::from))
    }

    pub async fn build(&self, order: Order) -> anyhow::Result<Invoice> {
        let payer = self.payer(&order).await?;
        Ok(InvoiceBuilder::default()
            .order(order)
            .payer(payer)
            .build()?)
    }
}

/// Emails the PDF invoice once an order is taken into work
pub struct InvoiceMailer {
    invoices: Invoices,
    pdf: Arc<dyn PdfRenderer>,
    mailer: Arc<dyn Mailer>,
}

impl InvoiceMailer {
    pub fn new(invoices: Invoices, pdf: Arc<dyn PdfRenderer>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            invoices,
            pdf,
            mailer,
        }
    }
}

impl Actor for InvoiceMailer {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.subscribe_system_async::<OrderStatusChanged>(ctx);
    }
}

pub fn invoice_message(invoice: &Invoice, pdf: Vec<u8>) -> Message {
    let order = &invoice.order;
    let body = format!(
        "Здравствуйте, {}!\n\n\
         Ваш заказ #{} принят в работу. Во вложении счет № {} на сумму {} руб.\n\n\
         С уважением,\n{}",
        order.customer_name(),
        order.id,
        invoice.number(),
        format_money(order.total()),
        invoice.seller,
    );
    Message::new(
        format!("Счет на оплату заказа #{}", order.id),
        body,
        vec![order.email.clone()],
    )
    .with_attachment(MailAttachment {
        filename: invoice.pdf_filename(),
        content_type: mime::APPLICATION_PDF,
        data: pdf,
    })
}

async fn send_invoice(
    invoices: Invoices,
    pdf: Arc<dyn PdfRenderer>,
    mailer: Arc<dyn Mailer>,
    order: Order,
) -> anyhow::Result<()> {
    let id = order.id;
    let invoice = invoices.build(order).await?;
    let html = invoice.render_html()?;
    let pdf = pdf
        .render(&html)
        .await
        .with_context(|| format!("Unable to render invoice PDF for order #{id}"))?;
    mailer.send(invoice_message(&invoice, pdf)).await?;
    log::info!("Invoice {} sent for order #{id}", invoice.number());
    Ok(())
}

impl Handler<OrderStatusChanged> for InvoiceMailer {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, event: OrderStatusChanged, _: &mut Self::Context) -> Self::Result {
        let invoices = self.invoices.clone();
        let pdf = self.pdf.clone();
        let mailer = self.mailer.clone();
        let send = event.order.status == OrderStatus::InProgress
            && event.previous != OrderStatus::InProgress;
        Box::pin(
            async move {
                if send {
                    send_invoice(invoices, pdf, mailer, event.order)
                        .await
                        .log_error("Unable to send invoice");
                }
            }
            .into_actor(self),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::repository::{SqliteCompanyRepository, SqliteUserRepository};
    use crate::cart::CartOwner;
    use crate::mail::tests::MemoryMailer;
    use crate::order::OrderItem;
    use gifts_types::access::{CompanyStatus, Password, User, UserRole};
    use rust_decimal_macros::dec;
    use time::macros::datetime;
    use tokio_rusqlite::Connection;
    use typesafe_repository::async_ops::Save;
    use uuid::Uuid;

    struct FakePdf;

    #[async_trait]
    impl PdfRenderer for FakePdf {
        async fn render(&self, html: &str) -> anyhow::Result<Vec<u8>> {
            Ok(format!("%PDF {}", html.len()).into_bytes())
        }
    }

    fn order(owner: Option<CartOwner>) -> Order {
        let now = datetime!(2024-12-31 22:30 UTC);
        Order {
            id: 42,
            owner,
            first_name: "Иван".to_string(),
            last_name: "Петров".to_string(),
            email: "ivan@example.com".to_string(),
            phone: "+7 900 000-00-00".to_string(),
            address: "Москва, ул. Ленина, 1".to_string(),
            comment: None,
            status: OrderStatus::InProgress,
            created_at: now,
            updated_at: now,
            items: vec![
                OrderItem {
                    id: 1,
                    order_id: 42,
                    product_id: Some("1".to_string()),
                    product_name: "Кружка <белая>".to_string(),
                    size: None,
                    quantity: 3,
                    price: dec!(150.5),
                },
                OrderItem {
                    id: 2,
                    order_id: 42,
                    product_id: Some("2".to_string()),
                    product_name: "Футболка".to_string(),
                    size: Some("L".to_string()),
                    quantity: 1,
                    price: dec!(500),
                },
            ],
        }
    }

    fn company() -> Company {
        Company {
            id: Uuid::new_v4(),
            inn: "7707083893".to_string(),
            legal_name: "Ромашка".to_string(),
            email: "info@romashka.ru".to_string(),
            kpp: Some("770701001".to_string()),
            legal_address: Some("Москва, ул. Вавилова, 19".to_string()),
            bank_account: Some("40702810400000000001".to_string()),
            bank_bik: Some("044525225".to_string()),
            organization_type: OrganizationType::Ooo,
            status: CompanyStatus::Active,
            verification_token: None,
            token_created_at: None,
            is_verified: true,
        }
    }

    fn user(email: &str, company_id: Option<Uuid>) -> User {
        User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password: Password::from_hash(String::new(), [0; 512]),
            company_id,
            role: UserRole::Accountant,
            first_name: "Иван".to_string(),
            last_name: "Петров".to_string(),
            middle_name: None,
            phone: None,
            is_active: true,
            is_staff: false,
        }
    }

    async fn invoices() -> (Invoices, Arc<SqliteUserRepository>, Arc<SqliteCompanyRepository>) {
        let conn = Connection::open_in_memory().await.unwrap();
        let users = Arc::new(SqliteUserRepository::init(conn.clone()).await.unwrap());
        let companies = Arc::new(SqliteCompanyRepository::init(conn).await.unwrap());
        (
            Invoices::new(users.clone(), companies.clone()),
            users,
            companies,
        )
    }

    #[test]
    fn numbers_invoices_by_moscow_year() {
        assert_eq!(
            invoice_number(42, datetime!(2024-12-31 22:30 UTC)),
            "INV-2025-000042"
        );
        assert_eq!(
            invoice_number(1234567, datetime!(2024-06-01 12:00 UTC)),
            "INV-2024-1234567"
        );
    }

    #[test]
    fn renders_html_for_private_customer() {
        let invoice = InvoiceBuilder::default()
            .order(order(Some(CartOwner::Session("s".to_string()))))
            .seller("Подарки".to_string())
            .date(datetime!(2024-12-31 22:30 UTC))
            .build()
            .unwrap();
        let html = invoice.render_html().unwrap();
        assert!(html.contains("Счет на оплату № INV-2025-000042 от 01.01.2025"));
        assert!(html.contains("Иван Петров"));
        assert!(html.contains("Кружка &lt;белая&gt;"));
        assert!(html.contains("451.50"));
        assert!(html.contains("951.50"));
        assert!(!html.contains("ИНН"));
    }

    #[tokio::test]
    async fn finds_company_payer() {
        let (invoices, users, companies) = invoices().await;
        let company = company();
        companies.save(company.clone()).await.unwrap();
        let member = user("ivan@example.com", Some(company.id));
        users.save(member.clone()).await.unwrap();
        let loner = user("olga@example.com", None);
        users.save(loner.clone()).await.unwrap();

        let payer = invoices
            .payer(&order(Some(CartOwner::User(member.id))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payer.inn, "7707083893");
        assert!(invoices
            .payer(&order(Some(CartOwner::User(loner.id))))
            .await
            .unwrap()
            .is_none());
        assert!(invoices.payer(&order(None)).await.unwrap().is_none());

        let html = invoices
            .build(order(Some(CartOwner::User(member.id))))
            .await
            .unwrap()
            .render_html()
            .unwrap();
        assert!(html.contains("ООО «Ромашка»"));
        assert!(html.contains("ИНН:</td><td>7707083893, КПП 770701001"));
        assert!(html.contains("044525225"));
    }

    #[test]
    fn writes_xlsx() {
        let invoice = InvoiceBuilder::default()
            .order(order(None))
            .build()
            .unwrap();
        let data = invoice.render_xlsx().unwrap();
        assert_eq!(&data[..2], b"PK");
        assert_eq!(invoice.xlsx_filename(), "Счет_42.xlsx");
    }

    #[actix_web::test]
    async fn mails_invoice_when_order_goes_in_progress() {
        let (invoices, _, _) = invoices().await;
        let mailer = Arc::new(MemoryMailer::default());
        let addr = InvoiceMailer::new(invoices, Arc::new(FakePdf), mailer.clone()).start();

        addr.send(OrderStatusChanged {
            order: order(None),
            previous: OrderStatus::New,
        })
        .await
        .unwrap();
        addr.send(OrderStatusChanged {
            order: Order {
                status: OrderStatus::Completed,
                ..order(None)
            },
            previous: OrderStatus::InProgress,
        })
        .await
        .unwrap();

        let sent = mailer.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Счет на оплату заказа #42");
        assert_eq!(sent[0].to, vec!["ivan@example.com".to_string()]);
        assert_eq!(sent[0].attachments[0].filename, "Счет_42.pdf");
        assert!(sent[0].attachments[0].data.starts_with(b"%PDF"));
    }

    #[actix_web::test]
    async fn logs_pdf_failures_without_mail() {
        let (invoices, _, _) = invoices().await;
        let mailer = Arc::new(MemoryMailer::default());
        let addr = InvoiceMailer::new(invoices, Arc::new(MissingRenderer), mailer.clone()).start();
        addr.send(OrderStatusChanged {
            order: order(None),
            previous: OrderStatus::New,
        })
        .await
        .unwrap();
        assert!(mailer.sent.lock().await.is_empty());
    }
}
