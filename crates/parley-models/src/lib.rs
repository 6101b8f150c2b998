pub mod attachment;
pub mod conversation;
pub mod gateway;
pub mod message;
pub mod presence;

pub type UserId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;

/// Snowflake ids travel as decimal strings so JavaScript clients keep full precision.
pub mod id_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(i64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.trim().parse().map_err(de::Error::custom),
            Raw::Num(n) => Ok(n),
        }
    }

    pub mod vec {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        #[derive(Serialize, Deserialize)]
        struct Id(#[serde(with = "super")] i64);

        pub fn serialize<S: Serializer>(ids: &[i64], serializer: S) -> Result<S::Ok, S::Error> {
            ids.iter().map(|&id| Id(id)).collect::<Vec<_>>().serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i64>, D::Error> {
            let ids = Vec::<Id>::deserialize(deserializer)?;
            Ok(ids.into_iter().map(|Id(id)| id).collect())
        }
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        #[derive(Serialize, Deserialize)]
        struct Id(#[serde(with = "super")] i64);

        pub fn serialize<S: Serializer>(id: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
            id.map(Id).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<i64>, D::Error> {
            Ok(Option::<Id>::deserialize(deserializer)?.map(|Id(id)| id))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "crate::id_str")]
        id: i64,
        #[serde(with = "crate::id_str::vec")]
        ids: Vec<i64>,
    }

    #[test]
    fn ids_serialize_as_strings() {
        let value = serde_json::to_value(Wrapper {
            id: 9_007_199_254_740_993,
            ids: vec![1, 2],
        })
        .unwrap();
        assert_eq!(value["id"], "9007199254740993");
        assert_eq!(value["ids"], serde_json::json!(["1", "2"]));
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        let parsed: Wrapper =
            serde_json::from_value(serde_json::json!({"id": 42, "ids": ["7", 8]})).unwrap();
        assert_eq!(parsed, Wrapper { id: 42, ids: vec![7, 8] });
    }
}
