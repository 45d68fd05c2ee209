use rusqlite::{params, OptionalExtension};

use super::{Database, DbResult};
use crate::rules::{Rule, RuleStatus};

impl Database {
    pub fn select_rules(&self) -> DbResult<Vec<Rule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT body FROM rules ORDER BY position ASC")?;
        let bodies = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut rules = Vec::new();
        for body in bodies {
            rules.push(serde_json::from_str(&body?)?);
        }
        Ok(rules)
    }

    pub fn replace_rules(&self, rules: &[Rule]) -> DbResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM rules", [])?;
        for (position, rule) in rules.iter().enumerate() {
            tx.execute(
                "INSERT INTO rules (id, position, body) VALUES (?1, ?2, ?3)",
                params![rule.id, position as i64, serde_json::to_string(rule)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_rule_status(&self, rule_id: &str, status: &RuleStatus) -> DbResult<bool> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM rules WHERE id = ?1",
                params![rule_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(body) = body else {
            return Ok(false);
        };
        let mut rule: Rule = serde_json::from_str(&body)?;
        rule.status = status.clone();
        conn.execute(
            "UPDATE rules SET body = ?1 WHERE id = ?2",
            params![serde_json::to_string(&rule)?, rule_id],
        )?;
        Ok(true)
    }
}
