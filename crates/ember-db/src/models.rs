/// Database row type. Maps directly to the `session` table.
#[derive(Debug, Clone, Default)]
pub struct SessionRow {
    pub access: Option<String>,
    pub refresh: Option<String>,
    pub user_json: Option<String>,
}
