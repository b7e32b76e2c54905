//! Typed source and target records per entity.
//!
//! Legacy column names are read with their English aliases as fallbacks,
//! since some installations renamed columns during earlier upgrades.

use super::codes::*;
use super::{Entity, MappedRecord, MappingContext, MappingError};
use crate::source::SourceRow;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of national ID (NIK) and family card number (No. KK).
pub const REGISTRY_NUMBER_LEN: usize = 16;

/// Legacy role id columns, also referenced by `tbl_user.id_level`.
const ROLE_ID_COLUMNS: &[&str] = &["id", "id_level"];

fn text(row: &SourceRow, columns: &[&str]) -> Option<String> {
    row.get_any(columns).as_text()
}

fn code(row: &SourceRow, columns: &[&str]) -> Option<i64> {
    row.get_any(columns).as_i64()
}

fn timestamp(row: &SourceRow, columns: &[&str]) -> Option<NaiveDateTime> {
    row.get_any(columns).as_datetime()
}

fn or_now(ts: Option<NaiveDateTime>) -> DateTime<Utc> {
    ts.map(|t| t.and_utc()).unwrap_or_else(Utc::now)
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, MappingError> {
    value.ok_or(MappingError::MissingField(field))
}

/// Validate a 16-digit registry number (national ID or family number).
pub fn validate_registry_number(value: &str, field: &'static str) -> Result<(), MappingError> {
    if value.len() != REGISTRY_NUMBER_LEN {
        return Err(MappingError::invalid(
            field,
            format!(
                "expected {} digits, got {} characters ('{}')",
                REGISTRY_NUMBER_LEN,
                value.chars().count(),
                value
            ),
        ));
    }
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MappingError::invalid(
            field,
            format!("must contain only digits ('{}')", value),
        ));
    }
    Ok(())
}

/// Neighbourhood unit numbers (RT/RW) are stored zero-padded to three digits.
fn pad_unit(value: Option<String>) -> Option<String> {
    value.map(|v| match v.parse::<u32>() {
        Ok(n) => format!("{:03}", n),
        Err(_) => v,
    })
}

// ===== Roles =====

#[derive(Debug, Clone, PartialEq)]
pub struct RoleSourceRecord {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub created_at: Option<NaiveDateTime>,
}

impl TryFrom<&SourceRow> for RoleSourceRecord {
    type Error = MappingError;

    fn try_from(row: &SourceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: code(row, ROLE_ID_COLUMNS),
            name: text(row, &["nama_level", "level", "name"]),
            description: text(row, &["keterangan", "description"]),
            created_at: timestamp(row, &["created_at"]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRecord {
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn map_role(source: RoleSourceRecord) -> Result<RoleRecord, MappingError> {
    let name = required(source.name, "name")?.to_lowercase();
    Ok(RoleRecord {
        name,
        description: source.description,
        created_at: or_now(source.created_at),
    })
}

impl MappedRecord for RoleRecord {
    const ENTITY: Entity = Entity::Roles;
    type Source = RoleSourceRecord;

    fn from_source(source: Self::Source, _: &MappingContext) -> Result<Self, MappingError> {
        map_role(source)
    }

    fn natural_key(&self) -> &str {
        &self.name
    }

    fn remember(&self, row: &SourceRow, context: &mut MappingContext) {
        if let Some(id) = code(row, ROLE_ID_COLUMNS) {
            context.add_role(id, self.name.clone());
        }
    }
}

// ===== Users =====

#[derive(Debug, Clone, PartialEq)]
pub struct UserSourceRecord {
    pub id: Option<i64>,
    pub username: Option<String>,
    pub password_hash: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub level: Option<i64>,
    pub active: Option<bool>,
    pub last_login: Option<NaiveDateTime>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl TryFrom<&SourceRow> for UserSourceRecord {
    type Error = MappingError;

    fn try_from(row: &SourceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: code(row, &["id", "id_user"]),
            username: text(row, &["username"]),
            password_hash: text(row, &["password", "password_hash"]),
            full_name: text(row, &["nama_lengkap", "nama", "full_name"]),
            email: text(row, &["email"]),
            level: code(row, &["id_level", "level"]),
            active: row.get_any(&["aktif", "status", "is_active"]).as_bool(),
            last_login: timestamp(row, &["last_login"]),
            created_at: timestamp(row, &["created_at"]),
            updated_at: timestamp(row, &["updated_at"]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub username: String,
    pub password_hash: Option<String>,
    pub full_name: String,
    pub email: Option<String>,
    /// Name of the migrated role the legacy level points at.
    pub role_name: String,
    pub is_active: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn map_user(
    source: UserSourceRecord,
    context: &MappingContext,
) -> Result<UserRecord, MappingError> {
    let username = required(source.username, "username")?.to_lowercase();
    if username.chars().any(char::is_whitespace) {
        return Err(MappingError::invalid(
            "username",
            format!("must not contain whitespace ('{}')", username),
        ));
    }
    let email = source.email.map(|e| e.to_lowercase());
    if let Some(ref e) = email {
        if !e.contains('@') {
            return Err(MappingError::invalid("email", format!("'{}' is not an address", e)));
        }
    }
    let level = required(source.level, "id_level")?;
    let role_name = context
        .role_name(level)
        .ok_or_else(|| {
            MappingError::invalid("id_level", format!("no migrated role has legacy id {}", level))
        })?
        .to_string();
    let created_at = or_now(source.created_at);
    Ok(UserRecord {
        full_name: source.full_name.unwrap_or_else(|| username.clone()),
        username,
        password_hash: source.password_hash,
        email,
        role_name,
        is_active: source.active.unwrap_or(true),
        last_login: source.last_login.map(|t| t.and_utc()),
        created_at,
        updated_at: source.updated_at.map(|t| t.and_utc()).unwrap_or(created_at),
    })
}

impl MappedRecord for UserRecord {
    const ENTITY: Entity = Entity::Users;
    type Source = UserSourceRecord;

    fn from_source(source: Self::Source, context: &MappingContext) -> Result<Self, MappingError> {
        map_user(source, context)
    }

    fn natural_key(&self) -> &str {
        &self.username
    }
}

// ===== Families =====

#[derive(Debug, Clone, PartialEq)]
pub struct FamilySourceRecord {
    pub id: Option<i64>,
    pub family_number: Option<String>,
    pub address: Option<String>,
    pub rt: Option<String>,
    pub rw: Option<String>,
    pub village: Option<String>,
    pub district: Option<String>,
    pub regency: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl TryFrom<&SourceRow> for FamilySourceRecord {
    type Error = MappingError;

    fn try_from(row: &SourceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: code(row, &["id", "id_kk"]),
            family_number: text(row, &["no_kk", "family_number"]),
            address: text(row, &["alamat", "address"]),
            rt: text(row, &["rt"]),
            rw: text(row, &["rw"]),
            village: text(row, &["desa", "kelurahan", "village"]),
            district: text(row, &["kecamatan", "district"]),
            regency: text(row, &["kabupaten", "regency"]),
            province: text(row, &["provinsi", "province"]),
            postal_code: text(row, &["kode_pos", "postal_code"]),
            created_at: timestamp(row, &["created_at"]),
            updated_at: timestamp(row, &["updated_at"]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyRecord {
    pub family_number: String,
    pub address: String,
    pub rt: Option<String>,
    pub rw: Option<String>,
    pub village: Option<String>,
    pub district: Option<String>,
    pub regency: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn map_family(source: FamilySourceRecord) -> Result<FamilyRecord, MappingError> {
    let family_number = required(source.family_number, "family_number")?;
    validate_registry_number(&family_number, "family_number")?;
    let created_at = or_now(source.created_at);
    Ok(FamilyRecord {
        family_number,
        address: source.address.unwrap_or_default(),
        rt: pad_unit(source.rt),
        rw: pad_unit(source.rw),
        village: source.village,
        district: source.district,
        regency: source.regency,
        province: source.province,
        postal_code: source.postal_code,
        created_at,
        updated_at: source.updated_at.map(|t| t.and_utc()).unwrap_or(created_at),
    })
}

impl MappedRecord for FamilyRecord {
    const ENTITY: Entity = Entity::Families;
    type Source = FamilySourceRecord;

    fn from_source(source: Self::Source, _: &MappingContext) -> Result<Self, MappingError> {
        map_family(source)
    }

    fn natural_key(&self) -> &str {
        &self.family_number
    }
}

// ===== Citizens =====

#[derive(Debug, Clone, PartialEq)]
pub struct CitizenSourceRecord {
    pub id: Option<i64>,
    pub national_id: Option<String>,
    pub family_number: Option<String>,
    pub full_name: Option<String>,
    pub birth_place: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<i64>,
    pub religion: Option<i64>,
    pub education: Option<i64>,
    pub occupation: Option<String>,
    pub marital_status: Option<i64>,
    pub blood_type: Option<i64>,
    pub nationality: Option<i64>,
    pub family_role: Option<i64>,
    pub father_name: Option<String>,
    pub mother_name: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl TryFrom<&SourceRow> for CitizenSourceRecord {
    type Error = MappingError;

    fn try_from(row: &SourceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: code(row, &["id", "id_penduduk"]),
            national_id: text(row, &["nik", "national_id"]),
            family_number: text(row, &["no_kk", "family_number"]),
            full_name: text(row, &["nama", "full_name"]),
            birth_place: text(row, &["tempat_lahir", "birth_place"]),
            birth_date: row.get_any(&["tanggal_lahir", "birth_date"]).as_date(),
            gender: code(row, &["jenis_kelamin", "gender"]),
            religion: code(row, &["agama", "religion"]),
            education: code(row, &["pendidikan", "education"]),
            occupation: text(row, &["pekerjaan", "occupation"]),
            marital_status: code(row, &["status_kawin", "marital_status"]),
            blood_type: code(row, &["golongan_darah", "blood_type"]),
            nationality: code(row, &["kewarganegaraan", "nationality"]),
            family_role: code(row, &["hubungan_keluarga", "family_role"]),
            father_name: text(row, &["nama_ayah", "father_name"]),
            mother_name: text(row, &["nama_ibu", "mother_name"]),
            created_at: timestamp(row, &["created_at"]),
            updated_at: timestamp(row, &["updated_at"]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitizenRecord {
    pub national_id: String,
    /// Natural key of the parent family; resolved to an id by the repository.
    pub family_number: String,
    pub full_name: String,
    pub birth_place: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Gender,
    pub religion: Religion,
    pub education: Education,
    pub occupation: Option<String>,
    pub marital_status: MaritalStatus,
    pub blood_type: BloodType,
    pub nationality: Nationality,
    pub family_role: FamilyRole,
    pub father_name: Option<String>,
    pub mother_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn map_citizen(source: CitizenSourceRecord) -> Result<CitizenRecord, MappingError> {
    let national_id = required(source.national_id, "national_id")?;
    validate_registry_number(&national_id, "national_id")?;
    let family_number = required(source.family_number, "family_number")?;
    validate_registry_number(&family_number, "family_number")?;
    let full_name = required(source.full_name, "full_name")?;
    let created_at = or_now(source.created_at);

    Ok(CitizenRecord {
        national_id,
        family_number,
        full_name,
        birth_place: source.birth_place,
        birth_date: source.birth_date,
        gender: map_gender(source.gender),
        religion: map_religion(source.religion),
        education: map_education(source.education),
        occupation: source.occupation,
        marital_status: map_marital_status(source.marital_status),
        blood_type: map_blood_type(source.blood_type),
        nationality: map_nationality(source.nationality),
        family_role: map_family_role(source.family_role),
        father_name: source.father_name,
        mother_name: source.mother_name,
        created_at,
        updated_at: source.updated_at.map(|t| t.and_utc()).unwrap_or(created_at),
    })
}

impl MappedRecord for CitizenRecord {
    const ENTITY: Entity = Entity::Citizens;
    type Source = CitizenSourceRecord;

    fn from_source(source: Self::Source, _: &MappingContext) -> Result<Self, MappingError> {
        map_citizen(source)
    }

    fn natural_key(&self) -> &str {
        &self.national_id
    }
}

// ===== Settings =====

#[derive(Debug, Clone, PartialEq)]
pub struct SettingSourceRecord {
    pub id: Option<i64>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub description: Option<String>,
    pub updated_at: Option<NaiveDateTime>,
}

impl TryFrom<&SourceRow> for SettingSourceRecord {
    type Error = MappingError;

    fn try_from(row: &SourceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: code(row, &["id", "id_setting"]),
            key: text(row, &["nama_setting", "setting_key", "key"]),
            value: text(row, &["nilai", "setting_value", "value"]),
            description: text(row, &["keterangan", "description"]),
            updated_at: timestamp(row, &["updated_at"]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingRecord {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub fn map_setting(source: SettingSourceRecord) -> Result<SettingRecord, MappingError> {
    let key = required(source.key, "key")?;
    Ok(SettingRecord {
        key: key.to_lowercase().replace(' ', "_"),
        value: source.value.unwrap_or_default(),
        description: source.description,
        updated_at: or_now(source.updated_at),
    })
}

impl MappedRecord for SettingRecord {
    const ENTITY: Entity = Entity::Settings;
    type Source = SettingSourceRecord;

    fn from_source(source: Self::Source, _: &MappingContext) -> Result<Self, MappingError> {
        map_setting(source)
    }

    fn natural_key(&self) -> &str {
        &self.key
    }
}
