/// The identity columns shared by every cache table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct KeyRow {
    pub(crate) row_id: i64,
    pub(crate) list_root: String,
    pub(crate) file_path: String,
    pub(crate) target_rate: Option<i64>,
}
