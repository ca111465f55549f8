//! 解释器引导脚本
//!
//! 子进程从 stdin 读取 JSON 信封 `{input, code, memory_limit, cpu_seconds, denied_modules}`：
//! 先按 input.kind 绑定 df / data / text / blob_ref，再设置 rlimit，最后在受限 builtins 下执行用户代码。
//! 用户代码拿到的模块一律是代理：只含公开的非模块属性（numpy 的 linalg / random / fft 除外），
//! import 语句同样返回代理，因此无法沿属性链走到 os 等模块。
//! rlimit：地址空间、CPU 秒数、写文件大小为 0、禁止新建进程。
//! 退出码：0 成功；2 执行异常；3 内存耗尽；4 运行时导入守卫拒绝。

pub const EXIT_OK: i32 = 0;
pub const EXIT_EXECUTION_ERROR: i32 = 2;
pub const EXIT_MEMORY: i32 = 3;
pub const EXIT_FORBIDDEN: i32 = 4;

pub const PRELUDE: &str = r#"
import builtins, contextlib, io, json, math, statistics, sys, types

_job = json.loads(sys.stdin.read())
_inp = _job["input"]

try:
    import pandas as pd
except Exception:
    pd = None
try:
    import numpy as np
except Exception:
    np = None

_KEEP = {"numpy": ("linalg", "random", "fft")}
_proxies = {}

def _public(mod):
    _hit = _proxies.get(id(mod))
    if _hit is not None:
        return _hit
    _ns = types.SimpleNamespace()
    _proxies[id(mod)] = _ns
    for _k, _v in list(vars(mod).items()):
        if _k.startswith("_") or isinstance(_v, types.ModuleType):
            continue
        setattr(_ns, _k, _v)
    for _k in _KEEP.get(mod.__name__, ()):
        _sub = getattr(mod, _k, None)
        if isinstance(_sub, types.ModuleType):
            setattr(_ns, _k, _public(_sub))
    return _ns

_g = {"json": _public(json), "math": _public(math), "statistics": _public(statistics)}
if pd is not None:
    pd.set_option("display.width", 120)
    pd.set_option("display.max_columns", 50)
    _g["pd"] = _public(pd)
if np is not None:
    _g["np"] = _public(np)

_kind = _inp["kind"]
if _kind == "table":
    _cols, _types, _recs = _inp["columns"], _inp["types"], _inp["records"]
    if pd is not None:
        _df = pd.DataFrame.from_records(_recs, columns=_cols)
        for _c, _t in zip(_cols, _types):
            if _t == "numeric":
                _df[_c] = pd.to_numeric(_df[_c], errors="coerce")
            else:
                _df[_c] = _df[_c].fillna("").astype(str)
        _g["df"] = _df
    else:
        _g["df"] = _recs
elif _kind == "structured":
    _g["data"] = _inp["data"]
elif _kind == "text":
    _g["text"] = _inp["text"]
else:
    _g["blob_ref"] = _inp["blob_ref"]

try:
    import resource
except Exception:
    resource = None

def _limit(name, value):
    try:
        resource.setrlimit(getattr(resource, name), (value, value))
    except Exception:
        pass

if resource is not None:
    if _job.get("memory_limit"):
        _limit("RLIMIT_AS", _job["memory_limit"])
    if _job.get("cpu_seconds"):
        _limit("RLIMIT_CPU", _job["cpu_seconds"])
    _limit("RLIMIT_FSIZE", 0)
    _limit("RLIMIT_NPROC", 0)

class _Forbidden(BaseException):
    pass

_denied = frozenset(_job.get("denied_modules", ()))
_real_import = builtins.__import__
# 用户代码即便捕获了 _Forbidden，作业仍按拒绝处理
_violations = []

def _forbid(what):
    _violations.append(what)
    return _Forbidden(what)

def _blocked(name):
    return name.startswith("_") or name.split(".")[0] in _denied

def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level or _blocked(name):
        raise _forbid(name or ".")
    for _item in fromlist or ():
        if _item != "*" and _blocked(_item):
            raise _forbid("%s.%s" % (name, _item))
    return _public(_real_import(name, None, None, fromlist, 0))

_safe = dict(builtins.__dict__)
for _name in (
    "open", "exec", "eval", "compile", "input", "breakpoint", "exit", "quit", "help",
    "globals", "locals", "vars", "getattr", "setattr", "delattr",
    "license", "credits", "copyright", "__loader__", "__spec__", "__package__",
):
    _safe.pop(_name, None)
_safe["__import__"] = _guarded_import
_g["__builtins__"] = _safe
_g["__name__"] = "__analysis__"

_out = io.StringIO()
try:
    _code = compile(_job["code"], "<analysis>", "exec")
    with contextlib.redirect_stdout(_out):
        exec(_code, _g)
except MemoryError:
    sys.stderr.write("MemoryError: memory limit exceeded\n")
    sys.exit(3)
except SyntaxError as _e:
    sys.stderr.write("SyntaxError: %s (line %s)\n" % (_e.msg, _e.lineno))
    sys.exit(2)
except BaseException as _e:
    if not _violations:
        sys.stderr.write("%s: %s\n" % (type(_e).__name__, _e))
        sys.exit(2)

if _violations:
    sys.stderr.write("Forbidden: import of '%s' is not allowed\n" % _violations[0])
    sys.exit(4)

sys.stdout.write(_out.getvalue())
if "result" in _g:
    sys.stdout.write(str(_g["result"]))
    sys.stdout.write("\n")
sys.stdout.flush()
"#;
