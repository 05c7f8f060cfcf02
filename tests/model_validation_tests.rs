use chrono::{NaiveDate, Utc};
use fleet_ops::{
    models::{
        AddOperationVehicleRequest, CreateDeliveryRequest, CreateVehicleRequest,
        CreateVehicleTypeRequest, DailyOperation, Delivery, DeliveryResponse, DeliveryStatus,
        OperationDetail, OperationStats, UpdateDeliveryRequest, UpdateVehicleTypeRequest, User,
        UserResponse,
    },
    permissions::{PermissionOverride, PermissionSet, resolve},
};
use serde_json::json;

#[test]
fn test_user_response_hides_password_hash() {
    let user = User {
        id: 3,
        username: "dana".into(),
        password_hash: "$argon2id$secret".into(),
        role_name: Some("Operator".into()),
        active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        ..Default::default()
    };
    let body = serde_json::to_value(UserResponse::from(user)).unwrap();
    assert_eq!(body["username"], "dana");
    assert_eq!(body["role_name"], "Operator");
    assert!(body.get("password_hash").is_none());
    assert!(body.get("failed_attempts").is_none());
}

#[test]
fn test_operation_detail_is_flat() {
    let detail = OperationDetail {
        operation: DailyOperation {
            id: 9,
            operation_date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            requested_vehicle_count: 4,
            ..Default::default()
        },
        vehicles: Vec::new(),
        stats: OperationStats { vehicles_started: 2, total_deliveries: 5, pending_deliveries: 3, completed_deliveries: 2 },
    };
    let body = serde_json::to_value(detail).unwrap();
    assert_eq!(body["id"], 9);
    assert_eq!(body["operation_date"], "2025-03-14");
    assert_eq!(body["vehicles_started"], 2);
    assert_eq!(body["completed_deliveries"], 2);
    assert!(body.get("stats").is_none());
}

#[test]
fn test_delivery_response_embeds_photos() {
    let body = serde_json::to_value(DeliveryResponse {
        delivery: Delivery { id: 1, invoice_number: "FV-1".into(), ..Default::default() },
        photos: Vec::new(),
    })
    .unwrap();
    assert_eq!(body["status"], "pending");
    assert_eq!(body["photos"], json!([]));
}

#[test]
fn test_unknown_delivery_status_is_rejected() {
    let parsed: Result<UpdateDeliveryRequest, _> = serde_json::from_value(json!({ "status": "lost" }));
    assert!(parsed.is_err());

    let parsed: UpdateDeliveryRequest = serde_json::from_value(json!({ "status": "completed" })).unwrap();
    assert_eq!(parsed.status, Some(DeliveryStatus::Completed));
}

#[test]
fn test_operation_vehicle_requires_a_plate() {
    let blank: AddOperationVehicleRequest =
        serde_json::from_value(json!({ "operation_id": 1, "plate": "   " })).unwrap();
    assert!(blank.validate().is_err());

    let plate: AddOperationVehicleRequest =
        serde_json::from_value(json!({ "operation_id": 1, "plate": "abc123", "start_time": "06:30:00" })).unwrap();
    assert!(plate.validate().is_ok());
    assert!(plate.start_time.is_some());
}

#[test]
fn test_delivery_requires_invoice_number() {
    let req: CreateDeliveryRequest = serde_json::from_value(json!({
        "vehicle_operation_id": 1,
        "invoice_number": "",
        "operation_date": "2025-03-14",
    }))
    .unwrap();
    assert!(req.validate().is_err());
}

#[test]
fn test_vehicle_defaults() {
    let req: CreateVehicleRequest =
        serde_json::from_value(json!({ "plate": "XYZ987", "vehicle_type_id": 1 })).unwrap();
    assert_eq!(req.status, "available");
    assert!(req.active);
    assert!(req.validate().is_ok());
}

#[test]
fn test_vehicle_type_status_is_a_closed_set() {
    let req: CreateVehicleTypeRequest = serde_json::from_value(json!({ "description": "Van" })).unwrap();
    assert_eq!(req.status, "active");
    assert!(req.validate().is_ok());

    let update = UpdateVehicleTypeRequest { status: Some("retired".into()), ..Default::default() };
    assert!(update.validate().is_err());
}

#[test]
fn test_override_layers_over_role_flag_by_flag() {
    let role = PermissionSet { can_view: true, can_create: true, can_edit: true, can_delete: false };
    let over = PermissionOverride { can_create: Some(false), can_delete: Some(true), ..Default::default() };

    let effective = resolve(Some(role), Some(over));
    assert_eq!(
        effective,
        PermissionSet { can_view: true, can_create: false, can_edit: true, can_delete: true }
    );

    // No role row and no override means no access.
    assert_eq!(resolve(None, None), PermissionSet::default());
    assert!(resolve(None, Some(PermissionOverride { can_view: Some(true), ..Default::default() })).can_view);
}
