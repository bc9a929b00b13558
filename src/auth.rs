use crate::db::last_insert_id;
use crate::error::{Error, Result};
use crate::models::{Account, Church};

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use hyper::header::AUTHORIZATION;
use hyper::HeaderMap;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Pastor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Pastor => "pastor",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Role> {
        match s {
            "pastor" => Ok(Role::Pastor),
            "admin" => Ok(Role::Admin),
            _ => Err(Error::Validation(format!("unknown role: {}", s))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Actor {
    pub id: i32,
    pub name: String,
    pub role: Role,
    pub church_id: Option<i32>,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    fn from_account(account: Account) -> Result<Actor> {
        Ok(Actor {
            id: account.id,
            role: account.role.parse()?,
            name: account.name,
            church_id: account.church_id,
        })
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let mut parts = value.splitn(2, ' ');
            match (parts.next(), parts.next()) {
                (Some(scheme), Some(token)) if scheme.eq_ignore_ascii_case("bearer") => {
                    Some(token.trim())
                }
                _ => None,
            }
        })
        .filter(|token| !token.is_empty())
}

pub fn authenticate(conn: &SqliteConnection, token: Option<&str>) -> Result<Actor> {
    use crate::schema::accounts::dsl::{accounts, api_token};

    let token = token.ok_or(Error::Unauthorized)?;
    let account = accounts
        .filter(api_token.eq(token))
        .first::<Account>(conn)
        .optional()?
        .ok_or(Error::Unauthorized)?;
    Actor::from_account(account)
}

pub fn create_church(conn: &SqliteConnection, church_name: &str) -> Result<Church> {
    use crate::schema::churches::dsl::{churches, name};

    let church_name = church_name.trim();
    if church_name.is_empty() {
        return Err(Error::MissingFieldError(vec!["name".to_owned()]));
    }
    conn.transaction::<_, Error, _>(|| {
        diesel::insert_into(churches)
            .values(name.eq(church_name))
            .execute(conn)?;
        let id = last_insert_id(conn)?;
        Ok(churches.find(id).first::<Church>(conn)?)
    })
}

pub fn find_church(conn: &SqliteConnection, id: i32) -> Result<Church> {
    use crate::schema::churches::dsl::churches;

    churches
        .find(id)
        .first::<Church>(conn)
        .optional()?
        .ok_or(Error::ChurchNotFound(id))
}

pub fn create_account(
    conn: &SqliteConnection,
    account_name: &str,
    account_role: Role,
    account_church_id: Option<i32>,
) -> Result<Account> {
    use crate::schema::accounts::dsl::*;

    let account_name = account_name.trim();
    if account_name.is_empty() {
        return Err(Error::MissingFieldError(vec!["name".to_owned()]));
    }
    if account_role == Role::Pastor && account_church_id.is_none() {
        return Err(Error::Validation(
            "a pastor account must belong to a church".to_owned(),
        ));
    }

    conn.transaction::<_, Error, _>(|| {
        if let Some(church) = account_church_id {
            find_church(conn, church)?;
        }
        let token = Uuid::new_v4().to_simple().to_string();
        diesel::insert_into(accounts)
            .values((
                name.eq(account_name),
                role.eq(account_role.as_str()),
                church_id.eq(account_church_id),
                api_token.eq(&token),
            ))
            .execute(conn)?;
        let new_id = last_insert_id(conn)?;
        Ok(accounts.find(new_id).first::<Account>(conn)?)
    })
}

#[cfg(test)]
pub mod fixtures {
    use super::{create_account, create_church, Actor, Role};
    use diesel::sqlite::SqliteConnection;

    pub fn pastor(conn: &SqliteConnection, church_name: &str) -> Actor {
        let church = create_church(conn, church_name).unwrap();
        let account = create_account(conn, "Pastor", Role::Pastor, Some(church.id)).unwrap();
        Actor::from_account(account).unwrap()
    }

    pub fn admin(conn: &SqliteConnection) -> Actor {
        let account = create_account(conn, "Admin", Role::Admin, None).unwrap();
        Actor::from_account(account).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_connection;
    use hyper::header::HeaderValue;

    #[test]
    fn authenticates_by_bearer_token() {
        let conn = test_connection();
        let church = create_church(&conn, "St Mary's").unwrap();
        let account = create_account(&conn, "Anna", Role::Pastor, Some(church.id)).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", account.api_token)).unwrap(),
        );
        let actor = authenticate(&conn, bearer_token(&headers)).unwrap();

        assert_eq!(actor.id, account.id);
        assert_eq!(actor.role, Role::Pastor);
        assert_eq!(actor.church_id, Some(church.id));
        assert!(!actor.is_admin());
    }

    #[test]
    fn rejects_missing_and_unknown_tokens() {
        let conn = test_connection();
        match authenticate(&conn, None) {
            Err(Error::Unauthorized) => {}
            other => panic!("expected Unauthorized, got {:?}", other),
        }
        match authenticate(&conn, Some("nope")) {
            Err(Error::Unauthorized) => {}
            other => panic!("expected Unauthorized, got {:?}", other),
        }
    }

    #[test]
    fn ignores_non_bearer_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer   "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn pastors_need_an_existing_church() {
        let conn = test_connection();
        assert!(create_account(&conn, "Ben", Role::Pastor, None).is_err());
        match create_account(&conn, "Ben", Role::Pastor, Some(99)) {
            Err(Error::ChurchNotFound(99)) => {}
            other => panic!("expected ChurchNotFound, got {:?}", other),
        }
        let admin = create_account(&conn, "Root", Role::Admin, None).unwrap();
        assert_eq!(admin.role, "admin");
        assert_ne!(admin.api_token, "");
    }
}
