//! Users write posts, posts carry tags, and a user may have a profile.

use std::sync::Arc;

use keel::{
    ColumnDef, Entity, FieldKind, JoinSpec, LinkTable, Registry, Related, RelatedMany,
    RelationSlot, RelationshipDef, Result, Row, SqlType, Value,
};

use super::MemoryDb;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub id: Option<i64>,
    pub name: String,
    pub email: Option<String>,
    pub age: i32,
    pub posts: RelatedMany<Post>,
    pub profile: Related<Profile>,
}

impl User {
    pub fn new(name: &str, age: i32) -> Self {
        Self {
            name: name.to_string(),
            email: Some(format!("{}@example.com", name.to_lowercase())),
            age,
            ..Self::default()
        }
    }

    pub fn with_posts(mut self, posts: Vec<Post>) -> Self {
        self.posts = RelatedMany::loaded(posts);
        self
    }
}

impl Entity for User {
    const TABLE_NAME: &'static str = "users";

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", SqlType::BigInt, FieldKind::I64)
                .primary_key()
                .generated(),
            ColumnDef::new("name", SqlType::VarChar(80), FieldKind::Text),
            ColumnDef::new("email", SqlType::VarChar(120), FieldKind::Text).nullable(),
            ColumnDef::new("age", SqlType::Integer, FieldKind::I32),
        ]
    }

    fn relationships() -> Vec<RelationshipDef> {
        vec![
            RelationshipDef::one_to_many::<Post>("posts", "author_id").cascade(),
            RelationshipDef::one_to_one::<Profile>("profile", JoinSpec::Remote("user_id"))
                .cascade(),
        ]
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("email", self.email.clone().into()),
            ("age", self.age.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            email: row.get_named("email")?,
            age: row.get_named("age")?,
            ..Self::default()
        })
    }

    fn set_primary_key(&mut self, key: &Value) -> Result<()> {
        self.id = key.as_i64();
        Ok(())
    }

    fn relation(&self, name: &str) -> Option<&dyn RelationSlot> {
        match name {
            "posts" => Some(&self.posts),
            "profile" => Some(&self.profile),
            _ => None,
        }
    }

    fn relation_mut(&mut self, name: &str) -> Option<&mut dyn RelationSlot> {
        match name {
            "posts" => Some(&mut self.posts),
            "profile" => Some(&mut self.profile),
            _ => None,
        }
    }
}

/// The author handle doubles as the `author_id` column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Post {
    pub id: Option<i64>,
    pub title: String,
    pub author: Related<User>,
    pub tags: RelatedMany<Tag>,
}

impl Post {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
    }

    pub fn by(mut self, author_id: i64) -> Self {
        self.author = Related::from_fk(author_id);
        self
    }

    pub fn with_tags(mut self, tags: Vec<Tag>) -> Self {
        self.tags = RelatedMany::loaded(tags);
        self
    }

    pub fn author_id(&self) -> Option<i64> {
        self.author.fk().and_then(Value::as_i64)
    }
}

impl Entity for Post {
    const TABLE_NAME: &'static str = "posts";

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", SqlType::BigInt, FieldKind::I64)
                .primary_key()
                .generated(),
            ColumnDef::new("title", SqlType::Text, FieldKind::Text),
            ColumnDef::new("author_id", SqlType::BigInt, FieldKind::I64),
        ]
    }

    fn relationships() -> Vec<RelationshipDef> {
        vec![
            RelationshipDef::many_to_one::<User>("author", "author_id").eager(),
            RelationshipDef::many_to_many::<Tag>(
                "tags",
                LinkTable::new("post_tags", "post_id", "tag_id"),
            )
            .cascade(),
        ]
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("title", self.title.clone().into()),
            ("author_id", self.author.fk().cloned().unwrap_or(Value::Null)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            title: row.get_named("title")?,
            author: Related::from_fk(row.get_named::<Option<i64>>("author_id")?),
            tags: RelatedMany::default(),
        })
    }

    fn set_primary_key(&mut self, key: &Value) -> Result<()> {
        self.id = key.as_i64();
        Ok(())
    }

    fn relation(&self, name: &str) -> Option<&dyn RelationSlot> {
        match name {
            "author" => Some(&self.author),
            "tags" => Some(&self.tags),
            _ => None,
        }
    }

    fn relation_mut(&mut self, name: &str) -> Option<&mut dyn RelationSlot> {
        match name {
            "author" => Some(&mut self.author),
            "tags" => Some(&mut self.tags),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tag {
    pub id: Option<i64>,
    pub label: String,
}

impl Tag {
    pub fn new(label: &str) -> Self {
        Self {
            id: None,
            label: label.to_string(),
        }
    }
}

impl Entity for Tag {
    const TABLE_NAME: &'static str = "tags";

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", SqlType::BigInt, FieldKind::I64)
                .primary_key()
                .generated(),
            ColumnDef::new("label", SqlType::VarChar(40), FieldKind::Text),
        ]
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("label", self.label.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            label: row.get_named("label")?,
        })
    }

    fn set_primary_key(&mut self, key: &Value) -> Result<()> {
        self.id = key.as_i64();
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    pub id: Option<i64>,
    pub user_id: Option<i64>,
    pub bio: Option<String>,
}

impl Entity for Profile {
    const TABLE_NAME: &'static str = "profiles";

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", SqlType::BigInt, FieldKind::I64)
                .primary_key()
                .generated(),
            ColumnDef::new("user_id", SqlType::BigInt, FieldKind::I64),
            ColumnDef::new("bio", SqlType::Text, FieldKind::Text).nullable(),
        ]
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("user_id", self.user_id.into()),
            ("bio", self.bio.clone().into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            user_id: row.get_named("user_id")?,
            bio: row.get_named("bio")?,
        })
    }

    fn set_primary_key(&mut self, key: &Value) -> Result<()> {
        self.id = key.as_i64();
        Ok(())
    }
}

pub fn registry() -> Arc<Registry> {
    let mut builder = Registry::builder();
    builder
        .register::<User>()
        .and_then(|b| b.register::<Post>())
        .and_then(|b| b.register::<Tag>())
        .and_then(|b| b.register::<Profile>())
        .expect("register entities");
    Arc::new(builder.build().expect("build registry"))
}

/// A team eagerly loads its members, and each member eagerly joins its team.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    pub members: RelatedMany<Member>,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_members(mut self, members: Vec<Member>) -> Self {
        self.members = RelatedMany::loaded(members);
        self
    }
}

impl Entity for Team {
    const TABLE_NAME: &'static str = "teams";

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", SqlType::BigInt, FieldKind::I64)
                .primary_key()
                .generated(),
            ColumnDef::new("name", SqlType::VarChar(80), FieldKind::Text),
        ]
    }

    fn relationships() -> Vec<RelationshipDef> {
        vec![
            RelationshipDef::one_to_many::<Member>("members", "team_id")
                .eager()
                .cascade(),
        ]
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            members: RelatedMany::default(),
        })
    }

    fn set_primary_key(&mut self, key: &Value) -> Result<()> {
        self.id = key.as_i64();
        Ok(())
    }

    fn relation(&self, name: &str) -> Option<&dyn RelationSlot> {
        (name == "members").then_some(&self.members as &dyn RelationSlot)
    }

    fn relation_mut(&mut self, name: &str) -> Option<&mut dyn RelationSlot> {
        (name == "members").then_some(&mut self.members as &mut dyn RelationSlot)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Member {
    pub id: Option<i64>,
    pub name: String,
    pub team: Related<Team>,
}

impl Member {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn team_id(&self) -> Option<i64> {
        self.team.fk().and_then(Value::as_i64)
    }
}

impl Entity for Member {
    const TABLE_NAME: &'static str = "members";

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", SqlType::BigInt, FieldKind::I64)
                .primary_key()
                .generated(),
            ColumnDef::new("name", SqlType::VarChar(80), FieldKind::Text),
            ColumnDef::new("team_id", SqlType::BigInt, FieldKind::I64),
        ]
    }

    fn relationships() -> Vec<RelationshipDef> {
        vec![RelationshipDef::many_to_one::<Team>("team", "team_id").eager()]
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("team_id", self.team.fk().cloned().unwrap_or(Value::Null)),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            team: Related::from_fk(row.get_named::<Option<i64>>("team_id")?),
        })
    }

    fn set_primary_key(&mut self, key: &Value) -> Result<()> {
        self.id = key.as_i64();
        Ok(())
    }

    fn relation(&self, name: &str) -> Option<&dyn RelationSlot> {
        (name == "team").then_some(&self.team as &dyn RelationSlot)
    }

    fn relation_mut(&mut self, name: &str) -> Option<&mut dyn RelationSlot> {
        (name == "team").then_some(&mut self.team as &mut dyn RelationSlot)
    }
}

/// Registry of the mutually eager team model.
pub fn team_registry() -> Arc<Registry> {
    let mut builder = Registry::builder();
    builder
        .register::<Team>()
        .and_then(|b| b.register::<Member>())
        .expect("register entities");
    Arc::new(builder.build().expect("build registry"))
}

/// A database with the tables of this model.
pub fn database() -> Arc<MemoryDb> {
    let db = MemoryDb::new();
    db.table("users", "id")
        .unique("users", "email")
        .table("posts", "id")
        .table("tags", "id")
        .table("profiles", "id")
        .table("teams", "id")
        .table("members", "id");
    db
}
