use crate::CuckooMap;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::marker::PhantomData;
use serde::de::{Deserialize, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserializer;
use std::alloc::{Allocator, Global};

pub struct CuckooMapVisitor<K, V, H> {
    marker: PhantomData<fn() -> CuckooMap<K, V, H, Global>>,
}

impl<K, V, H> CuckooMapVisitor<K, V, H> {
    fn new() -> Self {
        CuckooMapVisitor {
            marker: PhantomData,
        }
    }
}

impl<'de, K, V, H> Visitor<'de> for CuckooMapVisitor<K, V, H>
where
    K: Deserialize<'de> + Eq + Hash + Send + Sync,
    V: Deserialize<'de> + Send + Sync,
    H: BuildHasher + Default + Sync,
{
    type Value = CuckooMap<K, V, H, Global>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a CuckooMap")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let size = access.size_hint().unwrap_or(4);
        let map = CuckooMap::with_capacity_and_hasher(size, Default::default());

        while let Some((key, value)) = access.next_entry()? {
            map.insert(key, value).map_err(serde::de::Error::custom)?;
        }

        Ok(map)
    }
}

impl<'de, K, V, H> Deserialize<'de> for CuckooMap<K, V, H, Global>
where
    K: Deserialize<'de> + Eq + Hash + Send + Sync,
    V: Deserialize<'de> + Send + Sync,
    H: BuildHasher + Default + Sync,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(CuckooMapVisitor::<K, V, H>::new())
    }
}

impl<K, V, H, A, const S: usize> Serialize for CuckooMap<K, V, H, A, S>
where
    K: Serialize + Eq + Hash + Send + Sync,
    V: Serialize + Send + Sync,
    H: BuildHasher + Sync,
    A: Allocator + Sync,
{
    fn serialize<S2>(&self, serializer: S2) -> Result<S2::Ok, S2::Error>
    where
        S2: Serializer,
    {
        // Locking the table gives a coherent snapshot to serialize.
        let table = self.lock_table();
        let mut map = serializer.serialize_map(Some(table.len()))?;

        for (key, value) in table.iter() {
            map.serialize_entry(key, value)?;
        }

        map.end()
    }
}
