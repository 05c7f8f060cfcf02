use axum::{
    Json,
    extract::{Query, State},
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};

use crate::{
    AppState,
    auth::AuthUser,
    error::ApiError,
    handlers::deliveries::with_photos,
    models::{DashboardKpis, DeliveryResponse, DeliverySearch, DeliverySearchQuery, KpiQuery, Window},
    permissions::{Action, pages},
};

/// get_kpis
///
/// [Authenticated Route] Headline counters for the dashboard. `from`/`to` restrict
/// operation dates only when both are given; the "today" counters always use the
/// business timezone.
#[utoipa::path(
    get,
    path = "/api/dashboard/kpis",
    tag = "dashboard",
    params(KpiQuery),
    responses(
        (status = 200, description = "Dashboard KPIs", body = DashboardKpis),
        (status = 403, description = "Missing dashboard:view")
    )
)]
pub async fn get_kpis(
    user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<KpiQuery>,
) -> Result<Json<DashboardKpis>, ApiError> {
    user.require(state.repo.as_ref(), pages::DASHBOARD, Action::View).await?;

    let range = query.from.zip(query.to);
    let counts = state
        .repo
        .kpi_counts(range, state.config.business_today())
        .await?;
    Ok(Json(counts.into()))
}

/// search_deliveries
///
/// [Authenticated Route] Cross-operation delivery search behind the queries screen.
/// Completion dates are whole business days, both bounds inclusive.
#[utoipa::path(
    get,
    path = "/api/dashboard/deliveries",
    tag = "dashboard",
    params(DeliverySearchQuery),
    responses(
        (status = 200, description = "Matching deliveries, newest operation first", body = [DeliveryResponse]),
        (status = 403, description = "Missing queries:view")
    )
)]
pub async fn search_deliveries(
    user: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<DeliverySearchQuery>,
) -> Result<Json<Vec<DeliveryResponse>>, ApiError> {
    let repo = state.repo.as_ref();
    user.require(repo, pages::QUERIES, Action::View).await?;

    let offset = state.config.business_offset();
    let completed_from = query
        .completed_from
        .map(|day| day_start(offset, day))
        .transpose()?;
    let completed_before = query
        .completed_to
        .map(|day| {
            day.succ_opt()
                .ok_or_else(|| ApiError::bad_request("completed_to is out of range"))
                .and_then(|next| day_start(offset, next))
        })
        .transpose()?;

    let search = DeliverySearch {
        operation_from: query.operation_from,
        operation_to: query.operation_to,
        completed_from,
        completed_before,
        plate: query.plate.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()),
        status: query.status,
        window: Window::new(query.skip, query.limit),
    };

    let deliveries = repo.search_deliveries(search).await?;
    with_photos(repo, deliveries).await.map(Json)
}

/// Midnight of `day` in the business timezone, as a UTC instant.
fn day_start(offset: FixedOffset, day: NaiveDate) -> Result<DateTime<Utc>, ApiError> {
    day.and_time(NaiveTime::MIN)
        .and_local_timezone(offset)
        .single()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| ApiError::bad_request("date is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_midnight_is_five_in_the_morning_utc() {
        let offset = FixedOffset::west_opt(5 * 3600).unwrap();
        let day = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();

        let start = day_start(offset, day).unwrap();
        assert_eq!(start.to_rfc3339(), "2025-03-14T05:00:00+00:00");
    }
}
