use std::collections::HashSet;

use base64::Engine;
use diesel::{
    self,
    dsl::sql,
    insert_into,
    result::{DatabaseErrorKind::UniqueViolation, Error as DieselError},
    sql_types::Integer,
    ExpressionMethods, OptionalExtension, QueryDsl, RunQueryDsl,
};
use weavestorage_db_common::{params, results, UserIdentifier, BATCH_LIFETIME};

use super::{
    models::SqliteDb,
    schema::{batch_upload_items, batch_uploads},
    DbError, DbResult,
};

const MAX_BATCH_CREATE_RETRY: u8 = 5;

pub fn create(db: &SqliteDb, params: params::CreateBatch) -> DbResult<results::CreateBatch> {
    let user_id = params.user_id.legacy_id as i64;
    let collection_id = db.get_collection_id_sync(&params.collection)?;
    // Sync timestamps are quantized to two decimal places, so a batch id
    // built from one always ends in a zero digit. Mix in the lowest digit
    // of the uid so ids from users racing within the same centisecond nearly
    // always differ, while the id still reads as a millisecond timestamp.
    let mut batch_id = db.timestamp().as_i64() + (user_id % 10);
    // Raced creations on the same user can still clash, so retry with
    // increments before giving up.
    for i in 1..=MAX_BATCH_CREATE_RETRY {
        let result = insert_into(batch_uploads::table)
            .values((
                batch_uploads::batch_id.eq(&batch_id),
                batch_uploads::user_id.eq(&user_id),
                batch_uploads::collection_id.eq(&collection_id),
            ))
            .execute(&mut *db.conn()?);
        match result {
            Ok(_) => break,
            Err(DieselError::DatabaseError(UniqueViolation, _)) => {
                if i == MAX_BATCH_CREATE_RETRY {
                    return Err(DbError::conflict());
                }
                batch_id += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    do_append(db, batch_id, params.user_id, params.bsos)?;
    Ok(results::CreateBatch {
        id: encode_id(batch_id),
        size: None,
    })
}

pub fn validate(db: &SqliteDb, params: params::ValidateBatch) -> DbResult<bool> {
    let batch_id = decode_id(&params.id)?;
    // Avoid hitting the db for batches that are obviously too old. Recall
    // that the batch id is a millisecond timestamp.
    if (batch_id + BATCH_LIFETIME) < db.timestamp().as_i64() {
        return Ok(false);
    }

    let user_id = params.user_id.legacy_id as i64;
    let collection_id = db.get_collection_id_sync(&params.collection)?;
    let exists = batch_uploads::table
        .select(sql::<Integer>("1"))
        .filter(batch_uploads::batch_id.eq(&batch_id))
        .filter(batch_uploads::user_id.eq(&user_id))
        .filter(batch_uploads::collection_id.eq(&collection_id))
        .get_result::<i32>(&mut *db.conn()?)
        .optional()?;
    Ok(exists.is_some())
}

pub fn append(db: &SqliteDb, params: params::AppendToBatch) -> DbResult<()> {
    let exists = validate(
        db,
        params::ValidateBatch {
            user_id: params.user_id.clone(),
            collection: params.collection.clone(),
            id: params.batch.id.clone(),
        },
    )?;

    if !exists {
        return Err(DbError::batch_not_found());
    }

    let batch_id = decode_id(&params.batch.id)?;
    do_append(db, batch_id, params.user_id, params.bsos)?;
    Ok(())
}

pub fn get(db: &SqliteDb, params: params::GetBatch) -> DbResult<Option<results::GetBatch>> {
    let is_valid = validate(
        db,
        params::ValidateBatch {
            user_id: params.user_id,
            collection: params.collection,
            id: params.id.clone(),
        },
    )?;
    Ok(is_valid.then(|| results::GetBatch { id: params.id }))
}

pub fn delete(db: &SqliteDb, params: params::DeleteBatch) -> DbResult<()> {
    let batch_id = decode_id(&params.id)?;
    let user_id = params.user_id.legacy_id as i64;
    let collection_id = db.get_collection_id_sync(&params.collection)?;
    let mut conn = db.conn()?;
    diesel::delete(batch_uploads::table)
        .filter(batch_uploads::batch_id.eq(&batch_id))
        .filter(batch_uploads::user_id.eq(&user_id))
        .filter(batch_uploads::collection_id.eq(&collection_id))
        .execute(&mut *conn)?;
    diesel::delete(batch_upload_items::table)
        .filter(batch_upload_items::batch_id.eq(&batch_id))
        .filter(batch_upload_items::user_id.eq(&user_id))
        .execute(&mut *conn)?;
    Ok(())
}

/// Commits a batch to the bso table, deleting the batch when successful.
///
/// Every materialized row gets the commit timestamp as its `modified`, and
/// item TTLs count from the commit, not from when the item was appended.
pub fn commit(db: &SqliteDb, params: params::CommitBatch) -> DbResult<results::CommitBatch> {
    let batch_id = decode_id(&params.batch.id)?;
    let user_id = params.user_id.legacy_id as i64;
    let collection_id = db.get_collection_id_sync(&params.collection)?;
    let timestamp = db.timestamp();

    let items = batch_upload_items::table
        .select((
            batch_upload_items::id,
            batch_upload_items::sortindex,
            batch_upload_items::payload,
            batch_upload_items::ttl_offset,
        ))
        .filter(batch_upload_items::batch_id.eq(&batch_id))
        .filter(batch_upload_items::user_id.eq(&user_id))
        .load::<(String, Option<i32>, Option<String>, Option<i32>)>(&mut *db.conn()?)?;

    for (id, sortindex, payload, ttl_offset) in items {
        db.put_bso_sync(params::PutBso {
            user_id: params.user_id.clone(),
            collection: params.collection.clone(),
            id,
            sortindex,
            payload,
            ttl: ttl_offset.map(|ttl| ttl as u32),
        })?;
    }

    db.update_collection_sync(user_id as u64, collection_id)?;

    delete(
        db,
        params::DeleteBatch {
            user_id: params.user_id,
            collection: params.collection,
            id: params.batch.id,
        },
    )?;
    Ok(timestamp)
}

pub fn do_append(
    db: &SqliteDb,
    batch_id: i64,
    user_id: UserIdentifier,
    bsos: Vec<params::PostCollectionBso>,
) -> DbResult<()> {
    // The incoming list may itself contain duplicate ids, so a plain upsert
    // over the whole set won't do: track which ids are already present and
    // update those in place (last write wins within the batch).
    #[derive(AsChangeset)]
    #[diesel(table_name = batch_upload_items)]
    struct UpdateItem {
        sortindex: Option<i32>,
        payload: Option<String>,
        payload_size: Option<i64>,
        ttl_offset: Option<i32>,
    }

    let uid = user_id.legacy_id as i64;
    let mut existing: HashSet<String> = batch_upload_items::table
        .select(batch_upload_items::id)
        .filter(batch_upload_items::batch_id.eq(&batch_id))
        .filter(batch_upload_items::user_id.eq(&uid))
        .load::<String>(&mut *db.conn()?)?
        .into_iter()
        .collect();

    for bso in bsos {
        let payload_size = bso.payload.as_ref().map(|p| p.len() as i64);

        if existing.contains(&bso.id) {
            diesel::update(
                batch_upload_items::table
                    .filter(batch_upload_items::batch_id.eq(&batch_id))
                    .filter(batch_upload_items::user_id.eq(&uid))
                    .filter(batch_upload_items::id.eq(&bso.id)),
            )
            .set(&UpdateItem {
                sortindex: bso.sortindex,
                payload: bso.payload,
                payload_size,
                ttl_offset: bso.ttl.map(|ttl| ttl as i32),
            })
            .execute(&mut *db.conn()?)?;
        } else {
            diesel::insert_into(batch_upload_items::table)
                .values((
                    batch_upload_items::batch_id.eq(&batch_id),
                    batch_upload_items::user_id.eq(&uid),
                    batch_upload_items::id.eq(bso.id.clone()),
                    batch_upload_items::sortindex.eq(bso.sortindex),
                    batch_upload_items::payload.eq(bso.payload),
                    batch_upload_items::payload_size.eq(payload_size),
                    batch_upload_items::ttl_offset.eq(bso.ttl.map(|ttl| ttl as i32)),
                ))
                .execute(&mut *db.conn()?)?;
            existing.insert(bso.id);
        }
    }

    Ok(())
}

pub fn validate_batch_id(id: &str) -> DbResult<()> {
    decode_id(id).map(|_| ())
}

fn encode_id(id: i64) -> String {
    base64::engine::general_purpose::STANDARD.encode(id.to_string())
}

fn decode_id(id: &str) -> DbResult<i64> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(id)
        .unwrap_or_else(|_| id.as_bytes().to_vec());
    let decoded = std::str::from_utf8(&bytes).unwrap_or(id);
    decoded
        .parse::<i64>()
        .map_err(|e| DbError::internal(format!("Invalid batch_id: {}", e)))
}
