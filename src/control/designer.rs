use crate::control::{AdminAccess, ControllerError, MediaRoot, Response, Visitor};
use crate::designer::{
    self, DesignArea, DesignElement, DesignerRepository, ElementInput, FreePlacement,
    GarmentSize, NewCustomOrder, NewTemplate, ProductColor, Silhouette, Template, TemplateImage,
    UserDesign,
};
use crate::empty_string_as_none_parse;
use actix_multipart::form::{tempfile::TempFile, MultipartForm};
use actix_web::web::{Data, Json, Path, Query};
use actix_web::{get, post, HttpResponse};
use anyhow::Context as AnyhowContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Debug)]
pub struct ColorSwatch {
    #[serde(flatten)]
    pub color: ProductColor,
    pub display_value: String,
}

impl From<ProductColor> for ColorSwatch {
    fn from(color: ProductColor) -> Self {
        Self {
            display_value: color.display_value(),
            color,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct SizeOption {
    pub value: GarmentSize,
    pub label: String,
}

/// Everything the editor draws for one design
#[derive(Serialize, Debug)]
pub struct Editor {
    pub design: UserDesign,
    pub template: Template,
    pub front_image: Option<TemplateImage>,
    pub back_image: Option<TemplateImage>,
    pub images: Vec<TemplateImage>,
    pub areas: Vec<DesignArea>,
    pub elements: Vec<DesignElement>,
    pub colors: Vec<ColorSwatch>,
    pub sizes: Vec<SizeOption>,
    pub silhouette: Option<Silhouette>,
}

async fn editor(repo: &dyn DesignerRepository, design: UserDesign) -> Result<Editor, ControllerError> {
    let details = repo
        .template(design.template_id)
        .await?
        .ok_or(ControllerError::NotFound)?;
    let mut areas = details.areas.clone();
    areas.extend(repo.placed_areas(design.id).await?);
    let elements = repo.elements(design.id).await?;
    let colors = repo
        .colors(true)
        .await?
        .into_iter()
        .map(ColorSwatch::from)
        .collect();
    let sizes = details
        .template
        .sizes
        .iter()
        .map(|s| SizeOption {
            value: *s,
            label: s.label(),
        })
        .collect();
    let silhouette = repo.silhouette(design.template_id).await?;
    Ok(Editor {
        front_image: details.front_image().cloned(),
        back_image: details.back_image().cloned(),
        template: details.template,
        images: details.images,
        design,
        areas,
        elements,
        colors,
        sizes,
        silhouette,
    })
}

/// Design of the current visitor, `NotFound` for anyone else's
async fn own_design(
    repo: &dyn DesignerRepository,
    visitor: &Visitor,
    design_id: i64,
) -> Result<UserDesign, ControllerError> {
    repo.design(design_id)
        .await?
        .filter(|d| d.belongs_to(&visitor.session_key, visitor.user_id))
        .ok_or(ControllerError::NotFound)
}

#[derive(Deserialize, Debug)]
pub struct StartQuery {
    #[serde(default, deserialize_with = "empty_string_as_none_parse")]
    pub template_id: Option<i64>,
    #[serde(default)]
    pub product_id: Option<String>,
}

#[get("/designer/start")]
pub async fn start(
    repo: Data<Arc<dyn DesignerRepository>>,
    visitor: Visitor,
    q: Query<StartQuery>,
) -> Response {
    let q = q.into_inner();
    let template_id = match q.template_id {
        Some(id) => id,
        None => repo
            .templates(true)
            .await?
            .first()
            .map(|t| t.id)
            .ok_or(ControllerError::NotFound)?,
    };
    let design = repo
        .get_or_create_design(
            &visitor.session_key,
            visitor.user_id,
            template_id,
            q.product_id.filter(|p| !p.is_empty()),
        )
        .await?;
    log::debug!("Design {} for template {template_id}", design.id);
    Ok(HttpResponse::Ok().json(editor(repo.as_ref().as_ref(), design).await?))
}

#[get("/designer/edit/{design_id}")]
pub async fn edit(
    repo: Data<Arc<dyn DesignerRepository>>,
    visitor: Visitor,
    design_id: Path<i64>,
) -> Response {
    let repo = repo.as_ref().as_ref();
    let design = own_design(repo, &visitor, design_id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(editor(repo, design).await?))
}

#[derive(Deserialize, Debug)]
pub struct SaveElement {
    pub design_id: i64,
    pub area_id: i64,
    #[serde(flatten)]
    pub element: ElementInput,
}

#[post("/designer/save-element")]
pub async fn save_element(
    repo: Data<Arc<dyn DesignerRepository>>,
    visitor: Visitor,
    input: Json<SaveElement>,
) -> Response {
    let SaveElement {
        design_id,
        area_id,
        element,
    } = input.into_inner();
    let design = own_design(repo.as_ref().as_ref(), &visitor, design_id).await?;
    let element = repo.save_element(design.id, area_id, element).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "element": element,
    })))
}

#[derive(Deserialize, Debug)]
pub struct PlaceElement {
    pub design_id: i64,
    #[serde(flatten)]
    pub placement: FreePlacement,
}

#[post("/designer/place-element")]
pub async fn place_element(
    repo: Data<Arc<dyn DesignerRepository>>,
    visitor: Visitor,
    input: Json<PlaceElement>,
) -> Response {
    let PlaceElement {
        design_id,
        placement,
    } = input.into_inner();
    let design = own_design(repo.as_ref().as_ref(), &visitor, design_id).await?;
    let (element, area) = repo.place_element(design.id, placement).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "element_id": element.id,
        "area_id": area.id,
        "element": element,
        "area": area,
    })))
}

#[derive(Deserialize, Debug)]
pub struct DeleteElement {
    pub design_id: i64,
    pub element_id: i64,
}

#[post("/designer/delete-element")]
pub async fn delete_element(
    repo: Data<Arc<dyn DesignerRepository>>,
    visitor: Visitor,
    input: Json<DeleteElement>,
) -> Response {
    let design = own_design(repo.as_ref().as_ref(), &visitor, input.design_id).await?;
    repo.delete_element(design.id, input.element_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "success" })))
}

#[derive(MultipartForm, Debug)]
pub struct ImageUpload {
    file: TempFile,
}

#[post("/designer/upload-image")]
pub async fn upload_image(
    media_root: Data<MediaRoot>,
    _visitor: Visitor,
    form: MultipartForm<ImageUpload>,
) -> Response {
    let form = form.into_inner();
    let data = tokio::fs::read(form.file.file.path())
        .await
        .context("Unable to read uploaded image")?;
    let image_path =
        designer::store_element_image(&media_root.0, form.file.file_name.as_deref(), &data)
            .await
            .map_err(|err| ControllerError::invalid("image", err))?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "image_path": image_path,
        "url": format!("/media/{image_path}"),
    })))
}

#[get("/designer/colors")]
pub async fn color_list(repo: Data<Arc<dyn DesignerRepository>>) -> Response {
    let colors: Vec<ColorSwatch> = repo
        .colors(true)
        .await?
        .into_iter()
        .map(ColorSwatch::from)
        .collect();
    Ok(HttpResponse::Ok().json(colors))
}

#[post("/designer/save-order")]
pub async fn save_order(
    repo: Data<Arc<dyn DesignerRepository>>,
    visitor: Visitor,
    input: Json<NewCustomOrder>,
) -> Response {
    let input = input.into_inner();
    own_design(repo.as_ref().as_ref(), &visitor, input.design_id).await?;
    let order = repo.create_custom_order(input).await?;
    log::info!(
        "Custom order {} for design {}: {} x{}",
        order.id,
        order.design_id,
        order.price,
        order.quantity
    );
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "order_id": order.id,
        "redirect_url": "/cart",
    })))
}

/// Checks that the custom order was made from one of the visitor's designs
async fn own_custom_order(
    repo: &dyn DesignerRepository,
    visitor: &Visitor,
    id: i64,
) -> Result<(), ControllerError> {
    let order = repo.custom_order(id).await?.ok_or(ControllerError::NotFound)?;
    own_design(repo, visitor, order.design_id).await?;
    Ok(())
}

#[derive(Deserialize, Debug)]
pub struct QuantityInput {
    pub quantity: u32,
}

#[post("/designer/update-item/{item_id}")]
pub async fn update_item(
    repo: Data<Arc<dyn DesignerRepository>>,
    visitor: Visitor,
    item_id: Path<i64>,
    input: Json<QuantityInput>,
) -> Response {
    let item_id = item_id.into_inner();
    own_custom_order(repo.as_ref().as_ref(), &visitor, item_id).await?;
    let order = repo.update_custom_order(item_id, input.quantity).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "item": order,
    })))
}

#[post("/designer/remove-item/{item_id}")]
pub async fn remove_item(
    repo: Data<Arc<dyn DesignerRepository>>,
    visitor: Visitor,
    item_id: Path<i64>,
) -> Response {
    let item_id = item_id.into_inner();
    own_custom_order(repo.as_ref().as_ref(), &visitor, item_id).await?;
    repo.remove_custom_order(item_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "success" })))
}

#[post("/admin/designer/templates")]
pub async fn add_template(
    repo: Data<Arc<dyn DesignerRepository>>,
    _admin: AdminAccess,
    input: Json<NewTemplate>,
) -> Response {
    let template = repo.add_template(input.into_inner()).await?;
    log::info!("Added designer template {} ({})", template.name, template.id);
    Ok(HttpResponse::Created().json(template))
}

/// Template the admin refers to, `NotFound` when it does not exist
async fn existing_template(
    repo: &dyn DesignerRepository,
    template_id: i64,
) -> Result<(), ControllerError> {
    repo.template(template_id)
        .await?
        .map(|_| ())
        .ok_or(ControllerError::NotFound)
}

#[post("/admin/designer/templates/{template_id}/images")]
pub async fn add_template_image(
    repo: Data<Arc<dyn DesignerRepository>>,
    _admin: AdminAccess,
    template_id: Path<i64>,
    input: Json<TemplateImage>,
) -> Response {
    let template_id = template_id.into_inner();
    existing_template(repo.as_ref().as_ref(), template_id).await?;
    let image = repo
        .add_image(TemplateImage {
            template_id,
            ..input.into_inner()
        })
        .await?;
    Ok(HttpResponse::Created().json(image))
}

#[post("/admin/designer/templates/{template_id}/areas")]
pub async fn add_area(
    repo: Data<Arc<dyn DesignerRepository>>,
    _admin: AdminAccess,
    template_id: Path<i64>,
    input: Json<DesignArea>,
) -> Response {
    let template_id = template_id.into_inner();
    existing_template(repo.as_ref().as_ref(), template_id).await?;
    let area = repo
        .add_area(DesignArea {
            template_id,
            design_id: None,
            ..input.into_inner()
        })
        .await?;
    Ok(HttpResponse::Created().json(area))
}

#[post("/admin/designer/colors")]
pub async fn add_color(
    repo: Data<Arc<dyn DesignerRepository>>,
    _admin: AdminAccess,
    input: Json<ProductColor>,
) -> Response {
    let color = input.into_inner();
    if !lazy_regex::regex_is_match!(r"^#[0-9a-fA-F]{6}$", &color.hex_code) {
        return Err(ControllerError::invalid("hex_code", "Цвет должен быть в формате #RRGGBB"));
    }
    let color = repo.save_color(color).await?;
    Ok(HttpResponse::Ok().json(ColorSwatch::from(color)))
}

#[post("/admin/designer/templates/{template_id}/silhouette")]
pub async fn generate_silhouette(
    repo: Data<Arc<dyn DesignerRepository>>,
    media_root: Data<MediaRoot>,
    _admin: AdminAccess,
    template_id: Path<i64>,
) -> Response {
    let silhouette = designer::generate_silhouette(
        repo.as_ref().as_ref(),
        template_id.into_inner(),
        &media_root.0,
    )
    .await?;
    Ok(HttpResponse::Ok().json(silhouette))
}
