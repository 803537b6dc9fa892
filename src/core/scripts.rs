//! Purpose: The three server-side scripts and their invocation digests.
//! Exports: `Script`, `SET_AND_PUBLISH`, `APPEND`, `POP_FRONT`.
//! Role: Fixed read-modify-write-publish programs executed atomically by the store.
//! Invariants: A digest is the lowercase SHA-1 hex of the exact source text.
//! Invariants: Every script publishes `[tag, [encoded, ...]]` on the project channel.
use sha1::{Digest, Sha1};
use std::sync::OnceLock;

#[derive(Debug)]
pub struct Script {
    name: &'static str,
    source: &'static str,
    digest: OnceLock<String>,
}

impl Script {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self {
            name,
            source,
            digest: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn digest(&self) -> &str {
        self.digest.get_or_init(|| digest_of(self.source))
    }
}

pub fn digest_of(source: &str) -> String {
    format!("{:x}", Sha1::digest(source.as_bytes()))
}

/// KEYS: tag. ARGV: latest encoded value, JSON array of every encoded value
/// in the batch, project.
pub static SET_AND_PUBLISH: Script = Script::new(
    "set_and_publish",
    r#"local tag = KEYS[1]
local value = ARGV[1]
local batch = cjson.decode(ARGV[2])
local project = ARGV[3]
redis.call('publish', project, cjson.encode({tag, batch}))
return redis.call('set', project .. ':' .. tag, value)
"#,
);

/// KEYS: tag. ARGV: encoded item, project. Returns the new encoded list.
pub static APPEND: Script = Script::new(
    "append",
    r#"local function is_list(t)
  return type(t) == 'table' and (next(t) == nil or t[1] ~= nil)
end
local tag = KEYS[1]
local item = cjson.decode(ARGV[1])
local project = ARGV[2]
local key = project .. ':' .. tag
local current = redis.call('get', key)
local list
if current == false then
  list = {}
else
  list = cjson.decode(current)
  if not is_list(list) then
    return redis.error_reply('You can only append to a list')
  end
end
table.insert(list, item)
local encoded = cjson.encode(list)
redis.call('set', key, encoded)
redis.call('publish', project, cjson.encode({tag, {encoded}}))
return encoded
"#,
);

/// KEYS: tag. ARGV: project. Returns the removed element, encoded.
/// An emptied list is written back as `[]`; cjson would otherwise render `{}`.
pub static POP_FRONT: Script = Script::new(
    "pop_front",
    r#"local function is_list(t)
  return type(t) == 'table' and (next(t) == nil or t[1] ~= nil)
end
local tag = KEYS[1]
local project = ARGV[1]
local key = project .. ':' .. tag
local current = redis.call('get', key)
if current == false then
  return redis.error_reply('You can only remove elements from a list')
end
local list = cjson.decode(current)
if not is_list(list) then
  return redis.error_reply('You can only remove elements from a list')
end
local removed = table.remove(list, 1)
local encoded = cjson.encode(list)
if encoded == '{}' then
  encoded = '[]'
end
redis.call('set', key, encoded)
redis.call('publish', project, cjson.encode({tag, {encoded}}))
return cjson.encode(removed)
"#,
);
