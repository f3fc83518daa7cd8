// File: fei-sync/src/record.rs
// Purpose: Tracked record trait, collection names and the concrete FEI records

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::hash::Hash;

/// Free-form fields the server sends that this crate does not model.
/// Kept so a record written back to the cache loses nothing.
pub type ExtraFields = serde_json::Map<String, serde_json::Value>;

/// Collections kept in the local cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionName {
    Entities,
    Users,
    Feis,
    Carcasses,
    CarcassesIntermediaires,
}

impl CollectionName {
    /// Sync order: relations first, then forms, carcasses, intermediaries
    pub const ALL: [CollectionName; 5] = [
        CollectionName::Entities,
        CollectionName::Users,
        CollectionName::Feis,
        CollectionName::Carcasses,
        CollectionName::CarcassesIntermediaires,
    ];

    /// Collections fetched through `GET /<collection>?after=..`
    pub const INCREMENTAL: [CollectionName; 3] = [
        CollectionName::Feis,
        CollectionName::Carcasses,
        CollectionName::CarcassesIntermediaires,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionName::Entities => "entities",
            CollectionName::Users => "users",
            CollectionName::Feis => "feis",
            CollectionName::Carcasses => "carcasses",
            CollectionName::CarcassesIntermediaires => "carcasses-intermediaires",
        }
    }

    /// Store key holding the cached records
    pub fn store_key(&self) -> String {
        format!("collection:{}", self.as_str())
    }

    /// Store key holding the high-water mark
    pub fn mark_key(&self) -> String {
        format!("mark:{}", self.as_str())
    }

    pub fn is_incremental(&self) -> bool {
        Self::INCREMENTAL.contains(self)
    }
}

impl Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CollectionName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown collection: {s}"))
    }
}

/// An entity persisted both remotely and in the local offline cache
pub trait TrackedRecord:
    Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static
{
    /// Identity key, unique within the collection
    type Key: Eq + Hash + Ord + Clone + Debug + Display + Send + Sync;

    /// Collection this record lives in
    const COLLECTION: CollectionName;

    fn key(&self) -> Self::Key;

    fn updated_at(&self) -> DateTime<Utc>;

    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    fn set_updated_at(&mut self, at: DateTime<Utc>);

    fn set_deleted_at(&mut self, at: Option<DateTime<Utc>>);

    fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }
}

macro_rules! tracked_record {
    ($record:ty, $key:ty, $collection:expr, |$this:ident| $key_expr:expr) => {
        impl TrackedRecord for $record {
            type Key = $key;
            const COLLECTION: CollectionName = $collection;

            fn key(&self) -> Self::Key {
                let $this = self;
                $key_expr
            }

            fn updated_at(&self) -> DateTime<Utc> {
                self.updated_at
            }

            fn deleted_at(&self) -> Option<DateTime<Utc>> {
                self.deleted_at
            }

            fn set_updated_at(&mut self, at: DateTime<Utc>) {
                self.updated_at = at;
            }

            fn set_deleted_at(&mut self, at: Option<DateTime<Utc>>) {
                self.deleted_at = at;
            }
        }
    };
}

/// A wild-game chain-of-custody form ("fiche d'examen initial")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fei {
    pub numero: String,
    pub date_mise_a_mort: Option<DateTime<Utc>>,
    pub commune_mise_a_mort: Option<String>,
    pub created_by_user_id: Option<String>,
    pub examinateur_initial_user_id: Option<String>,
    pub premier_detenteur_user_id: Option<String>,
    pub premier_detenteur_entity_id: Option<String>,
    pub fei_current_owner_user_id: Option<String>,
    pub fei_current_owner_entity_id: Option<String>,
    pub fei_current_owner_role: Option<String>,
    pub fei_next_owner_user_id: Option<String>,
    pub fei_next_owner_entity_id: Option<String>,
    pub fei_next_owner_role: Option<String>,
    pub automatic_closed_at: Option<DateTime<Utc>>,
    pub svi_closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Fei {
    /// Closed forms are served from `/fei/done`
    pub fn is_closed(&self) -> bool {
        self.automatic_closed_at.is_some() || self.svi_closed_at.is_some()
    }
}

tracked_record!(Fei, String, CollectionName::Feis, |fei| fei.numero.clone());

/// Identity of a carcass: its bracelet within one form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CarcasseKey {
    pub fei_numero: String,
    pub numero_bracelet: String,
}

impl Display for CarcasseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.fei_numero, self.numero_bracelet)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Carcasse {
    pub zacharie_carcasse_id: String,
    pub fei_numero: String,
    pub numero_bracelet: String,
    pub espece: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub nombre_d_animaux: Option<u32>,
    pub svi_carcasse_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

tracked_record!(Carcasse, CarcasseKey, CollectionName::Carcasses, |c| CarcasseKey {
    fei_numero: c.fei_numero.clone(),
    numero_bracelet: c.numero_bracelet.clone(),
});

/// Identity of one intermediary handoff of a carcass
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntermediaireKey {
    pub fei_numero: String,
    pub numero_bracelet: String,
    pub intermediaire_id: String,
}

impl Display for IntermediaireKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.fei_numero, self.numero_bracelet, self.intermediaire_id
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarcasseIntermediaire {
    pub fei_numero: String,
    pub numero_bracelet: String,
    pub intermediaire_id: String,
    pub zacharie_carcasse_id: Option<String>,
    pub intermediaire_entity_id: Option<String>,
    pub intermediaire_user_id: Option<String>,
    pub prise_en_charge: Option<bool>,
    pub refus: Option<String>,
    pub commentaire: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

tracked_record!(
    CarcasseIntermediaire,
    IntermediaireKey,
    CollectionName::CarcassesIntermediaires,
    |ci| IntermediaireKey {
        fei_numero: ci.fei_numero.clone(),
        numero_bracelet: ci.numero_bracelet.clone(),
        intermediaire_id: ci.intermediaire_id.clone(),
    }
);

/// Registry entry (slaughterhouse, collection centre, SVI...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub raison_sociale: Option<String>,
    pub numero_ddecpp: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

tracked_record!(Entity, String, CollectionName::Entities, |e| e.id.clone());

/// A user, either a relation of the actor or the actor's own profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub prenom: Option<String>,
    pub nom_de_famille: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

tracked_record!(User, String, CollectionName::Users, |u| u.id.clone());
