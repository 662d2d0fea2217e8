use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    auth::SessionUser,
    error::{map_db_error, AppError, AppResult},
    models::{Agm, AgmResolution, AgmStatus, User, Vote, VoteChoice},
    services::{
        arrears::{arrears_for_user, format_ringgit, ArrearsSummary},
        audit::write_audit_log,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: Option<String>,
    pub total_arrears: Decimal,
    pub overridden: bool,
}

/// Arrears-based voting eligibility, superseded by a management override.
///
/// An override (either value) wins regardless of arrears. Without one, a user
/// needs at least one unit and zero total arrears.
pub fn evaluate_eligibility(
    unit_count: usize,
    arrears: &ArrearsSummary,
    override_value: Option<bool>,
    override_reason: Option<&str>,
) -> Eligibility {
    if let Some(eligible) = override_value {
        return Eligibility {
            eligible,
            reason: override_reason
                .map(str::trim)
                .filter(|reason| !reason.is_empty())
                .map(ToOwned::to_owned),
            total_arrears: arrears.total,
            overridden: true,
        };
    }

    if unit_count == 0 {
        return Eligibility {
            eligible: false,
            reason: Some("Tiada unit berdaftar.".to_string()),
            total_arrears: Decimal::ZERO,
            overridden: false,
        };
    }

    if arrears.has_arrears() {
        return Eligibility {
            eligible: false,
            reason: Some(format!(
                "Mempunyai tunggakan sebanyak {}.",
                format_ringgit(arrears.total)
            )),
            total_arrears: arrears.total,
            overridden: false,
        };
    }

    Eligibility {
        eligible: true,
        reason: None,
        total_arrears: Decimal::ZERO,
        overridden: false,
    }
}

pub async fn load_user(pool: &PgPool, user_id: Uuid) -> AppResult<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("Pengguna tidak dijumpai.".to_string()))
}

/// Always recomputed from current units and bills.
pub async fn eligibility_for_user(pool: &PgPool, user_id: Uuid) -> AppResult<Eligibility> {
    let user = load_user(pool, user_id).await?;
    let (units, arrears) = arrears_for_user(pool, user_id).await?;
    Ok(evaluate_eligibility(
        units.len(),
        &arrears,
        user.voting_eligibility_override,
        user.voting_eligibility_reason.as_deref(),
    ))
}

/// Set (`Some`) or clear (`None`) a user's eligibility override. Setting one
/// requires a reason.
pub async fn set_eligibility_override(
    pool: &PgPool,
    actor: &SessionUser,
    user_id: Uuid,
    value: Option<bool>,
    reason: Option<&str>,
) -> AppResult<User> {
    let reason = reason.map(str::trim).filter(|reason| !reason.is_empty());
    if value.is_some() && reason.is_none() {
        return Err(AppError::BadRequest(
            "Sebab diperlukan untuk menetapkan kelayakan mengundi.".to_string(),
        ));
    }
    let reason = value.and(reason);

    let before = load_user(pool, user_id).await?;
    let updated = sqlx::query_as::<_, User>(
        "UPDATE users
         SET voting_eligibility_override = $2, voting_eligibility_reason = $3
         WHERE id = $1
         RETURNING *",
    )
    .bind(user_id)
    .bind(value)
    .bind(reason)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    write_audit_log(
        Some(pool),
        Some(actor.id),
        if value.is_some() {
            "user.voting_override_set"
        } else {
            "user.voting_override_cleared"
        },
        "users",
        Some(&user_id.to_string()),
        Some(json!({
            "voting_eligibility_override": before.voting_eligibility_override,
            "voting_eligibility_reason": before.voting_eligibility_reason,
        })),
        Some(json!({
            "voting_eligibility_override": updated.voting_eligibility_override,
            "voting_eligibility_reason": updated.voting_eligibility_reason,
        })),
    )
    .await;

    Ok(updated)
}

pub async fn load_agm(pool: &PgPool, agm_id: Uuid) -> AppResult<Agm> {
    sqlx::query_as::<_, Agm>("SELECT * FROM agms WHERE id = $1")
        .bind(agm_id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("Mesyuarat agung tidak dijumpai.".to_string()))
}

pub async fn list_agms(pool: &PgPool) -> AppResult<Vec<Agm>> {
    sqlx::query_as::<_, Agm>("SELECT * FROM agms ORDER BY meeting_date DESC")
        .fetch_all(pool)
        .await
        .map_err(map_db_error)
}

pub async fn list_resolutions(pool: &PgPool, agm_id: Uuid) -> AppResult<Vec<AgmResolution>> {
    sqlx::query_as::<_, AgmResolution>(
        "SELECT * FROM agm_resolutions WHERE agm_id = $1 ORDER BY position, created_at",
    )
    .bind(agm_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)
}

pub async fn create_agm(
    pool: &PgPool,
    actor: &SessionUser,
    title: &str,
    meeting_date: NaiveDate,
) -> AppResult<Agm> {
    if title.trim().is_empty() {
        return Err(AppError::BadRequest("Tajuk mesyuarat diperlukan.".to_string()));
    }
    let agm = sqlx::query_as::<_, Agm>(
        "INSERT INTO agms (title, meeting_date, status, created_by)
         VALUES ($1, $2, 'DRAFT', $3)
         RETURNING *",
    )
    .bind(title.trim())
    .bind(meeting_date)
    .bind(actor.id)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    write_audit_log(
        Some(pool),
        Some(actor.id),
        "agm.created",
        "agms",
        Some(&agm.id.to_string()),
        None,
        Some(json!({ "title": agm.title, "meeting_date": agm.meeting_date })),
    )
    .await;
    Ok(agm)
}

pub async fn add_resolution(
    pool: &PgPool,
    actor: &SessionUser,
    agm_id: Uuid,
    title: &str,
    description: Option<&str>,
) -> AppResult<AgmResolution> {
    if title.trim().is_empty() {
        return Err(AppError::BadRequest("Tajuk resolusi diperlukan.".to_string()));
    }
    let agm = load_agm(pool, agm_id).await?;
    if agm.status != AgmStatus::Draft {
        return Err(AppError::Conflict(
            "Resolusi hanya boleh ditambah semasa draf.".to_string(),
        ));
    }

    let resolution = sqlx::query_as::<_, AgmResolution>(
        "INSERT INTO agm_resolutions (agm_id, title, description, position)
         VALUES ($1, $2, $3,
                 (SELECT COALESCE(MAX(position), 0) + 1 FROM agm_resolutions WHERE agm_id = $1))
         RETURNING *",
    )
    .bind(agm_id)
    .bind(title.trim())
    .bind(description.map(str::trim).filter(|text| !text.is_empty()))
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    write_audit_log(
        Some(pool),
        Some(actor.id),
        "agm.resolution_added",
        "agm_resolutions",
        Some(&resolution.id.to_string()),
        None,
        Some(json!({ "agm_id": agm_id, "title": resolution.title })),
    )
    .await;
    Ok(resolution)
}

/// DRAFT → ACTIVE → CLOSED; anything else is a conflict.
pub fn next_status(current: AgmStatus, target: AgmStatus) -> AppResult<AgmStatus> {
    match (current, target) {
        (AgmStatus::Draft, AgmStatus::Active) | (AgmStatus::Active, AgmStatus::Closed) => {
            Ok(target)
        }
        _ => Err(AppError::Conflict(format!(
            "Status mesyuarat tidak boleh ditukar dari {current:?} ke {target:?}."
        ))),
    }
}

pub async fn change_agm_status(
    pool: &PgPool,
    actor: &SessionUser,
    agm_id: Uuid,
    target: AgmStatus,
) -> AppResult<Agm> {
    let agm = load_agm(pool, agm_id).await?;
    let status = next_status(agm.status, target)?;
    if status == AgmStatus::Active && list_resolutions(pool, agm_id).await?.is_empty() {
        return Err(AppError::BadRequest(
            "Tambah sekurang-kurangnya satu resolusi sebelum mengaktifkan mesyuarat.".to_string(),
        ));
    }

    // Conditional update: a concurrent transition leaves zero rows.
    let updated = sqlx::query_as::<_, Agm>(
        "UPDATE agms SET status = $3 WHERE id = $1 AND status = $2 RETURNING *",
    )
    .bind(agm_id)
    .bind(agm.status)
    .bind(status)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::Conflict("Status mesyuarat telah berubah.".to_string()))?;

    write_audit_log(
        Some(pool),
        Some(actor.id),
        "agm.status_changed",
        "agms",
        Some(&agm_id.to_string()),
        Some(json!({ "status": agm.status })),
        Some(json!({ "status": updated.status })),
    )
    .await;
    Ok(updated)
}

/// Record or replace the caller's vote on a resolution. Eligibility is
/// evaluated now, not taken from whatever the client last displayed.
pub async fn cast_vote(
    pool: &PgPool,
    voter: &SessionUser,
    resolution_id: Uuid,
    choice: VoteChoice,
) -> AppResult<Vote> {
    let resolution = sqlx::query_as::<_, AgmResolution>(
        "SELECT * FROM agm_resolutions WHERE id = $1",
    )
    .bind(resolution_id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::NotFound("Resolusi tidak dijumpai.".to_string()))?;

    let agm = load_agm(pool, resolution.agm_id).await?;
    if agm.status != AgmStatus::Active {
        return Err(AppError::Conflict(
            "Pengundian hanya dibuka semasa mesyuarat aktif.".to_string(),
        ));
    }

    let eligibility = eligibility_for_user(pool, voter.id).await?;
    if !eligibility.eligible {
        let reason = eligibility
            .reason
            .unwrap_or_else(|| "Tidak layak mengundi.".to_string());
        return Err(AppError::Forbidden(format!(
            "Anda tidak layak mengundi: {reason}"
        )));
    }

    let vote = sqlx::query_as::<_, Vote>(
        "INSERT INTO votes (resolution_id, user_id, choice)
         VALUES ($1, $2, $3)
         ON CONFLICT (resolution_id, user_id)
         DO UPDATE SET choice = EXCLUDED.choice, updated_at = now()
         RETURNING *",
    )
    .bind(resolution_id)
    .bind(voter.id)
    .bind(choice)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    tracing::info!(agm_id = %agm.id, %resolution_id, user_id = %voter.id, ?choice, "Vote recorded");
    Ok(vote)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionTally {
    pub resolution_id: Uuid,
    pub title: String,
    pub setuju: i64,
    pub tidak_setuju: i64,
    pub berkecuali: i64,
    pub total: i64,
}

pub fn tally(
    resolutions: &[AgmResolution],
    counts: &[(Uuid, VoteChoice, i64)],
) -> Vec<ResolutionTally> {
    let mut by_resolution: HashMap<Uuid, ResolutionTally> = resolutions
        .iter()
        .map(|resolution| {
            (
                resolution.id,
                ResolutionTally {
                    resolution_id: resolution.id,
                    title: resolution.title.clone(),
                    ..ResolutionTally::default()
                },
            )
        })
        .collect();

    for (resolution_id, choice, count) in counts {
        let Some(row) = by_resolution.get_mut(resolution_id) else {
            continue;
        };
        match choice {
            VoteChoice::Setuju => row.setuju += count,
            VoteChoice::TidakSetuju => row.tidak_setuju += count,
            VoteChoice::Berkecuali => row.berkecuali += count,
        }
        row.total += count;
    }

    resolutions
        .iter()
        .filter_map(|resolution| by_resolution.remove(&resolution.id))
        .collect()
}

pub async fn agm_results(pool: &PgPool, agm_id: Uuid) -> AppResult<Vec<ResolutionTally>> {
    let resolutions = list_resolutions(pool, agm_id).await?;
    let counts: Vec<(Uuid, VoteChoice, i64)> = sqlx::query_as(
        "SELECT v.resolution_id, v.choice, COUNT(*)::bigint
         FROM votes v
         JOIN agm_resolutions r ON r.id = v.resolution_id
         WHERE r.agm_id = $1
         GROUP BY v.resolution_id, v.choice",
    )
    .bind(agm_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;
    Ok(tally(&resolutions, &counts))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::{evaluate_eligibility, next_status, tally};
    use crate::{
        models::{AgmResolution, AgmStatus, BillStatus, UnitType, VoteChoice},
        services::arrears::{
            compute_arrears,
            fixtures::{bill, unit},
        },
    };

    #[test]
    fn zero_arrears_is_eligible() {
        let units = vec![unit("A-1-1", UnitType::Atas, 0, 0)];
        let summary = compute_arrears(&units, &[]);
        let result = evaluate_eligibility(units.len(), &summary, None, None);
        assert!(result.eligible);
        assert!(result.reason.is_none());
        assert!(!result.overridden);
    }

    #[test]
    fn arrears_block_voting_with_amount_in_reason() {
        let j13 = unit("J-13-1", UnitType::Bawah, 100, 0);
        let bills = vec![bill(j13.id, 88, 3, 2025, BillStatus::Pending)];
        let summary = compute_arrears(std::slice::from_ref(&j13), &bills);

        let result = evaluate_eligibility(1, &summary, None, None);
        assert!(!result.eligible);
        assert_eq!(result.total_arrears, Decimal::from(188));
        let reason = result.reason.expect("reason present");
        assert!(reason.contains("RM 188.00"), "unexpected reason: {reason}");
    }

    #[test]
    fn users_without_units_cannot_vote() {
        let summary = compute_arrears(&[], &[]);
        let result = evaluate_eligibility(0, &summary, None, None);
        assert!(!result.eligible);
        assert!(result.reason.is_some());
    }

    #[test]
    fn override_wins_both_ways() {
        let j13 = unit("J-13-1", UnitType::Bawah, 100, 0);
        let in_arrears = compute_arrears(std::slice::from_ref(&j13), &[]);
        let allowed = evaluate_eligibility(
            1,
            &in_arrears,
            Some(true),
            Some("Pelan bayaran dipersetujui"),
        );
        assert!(allowed.eligible);
        assert!(allowed.overridden);
        assert_eq!(allowed.reason.as_deref(), Some("Pelan bayaran dipersetujui"));

        let clear = compute_arrears(&[unit("A-1-1", UnitType::Atas, 0, 0)], &[]);
        let denied = evaluate_eligibility(1, &clear, Some(false), Some("Proksi tidak sah"));
        assert!(!denied.eligible);

        let no_units = evaluate_eligibility(0, &compute_arrears(&[], &[]), Some(true), Some("x"));
        assert!(no_units.eligible);
    }

    #[test]
    fn agm_status_only_moves_forward() {
        assert_eq!(
            next_status(AgmStatus::Draft, AgmStatus::Active).ok(),
            Some(AgmStatus::Active)
        );
        assert_eq!(
            next_status(AgmStatus::Active, AgmStatus::Closed).ok(),
            Some(AgmStatus::Closed)
        );
        assert!(next_status(AgmStatus::Draft, AgmStatus::Closed).is_err());
        assert!(next_status(AgmStatus::Closed, AgmStatus::Active).is_err());
        assert!(next_status(AgmStatus::Active, AgmStatus::Active).is_err());
    }

    #[test]
    fn tally_keeps_resolution_order_and_ignores_strays() {
        let agm_id = Uuid::new_v4();
        let resolution = |title: &str, position: i32| AgmResolution {
            id: Uuid::new_v4(),
            agm_id,
            title: title.to_string(),
            description: None,
            position,
            created_at: Utc::now(),
        };
        let first = resolution("Lantik juruaudit", 1);
        let second = resolution("Naik caj", 2);
        let counts = vec![
            (second.id, VoteChoice::Setuju, 3),
            (first.id, VoteChoice::TidakSetuju, 2),
            (first.id, VoteChoice::Berkecuali, 1),
            (Uuid::new_v4(), VoteChoice::Setuju, 9),
        ];

        let results = tally(&[first.clone(), second.clone()], &counts);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].resolution_id, first.id);
        assert_eq!(results[0].tidak_setuju, 2);
        assert_eq!(results[0].total, 3);
        assert_eq!(results[1].setuju, 3);
    }
}
